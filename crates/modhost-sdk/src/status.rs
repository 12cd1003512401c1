//! HTTP status phrases and human readable explanations
//!
//! Used as defaults when a module raises an [`HttpError`](crate::HttpError)
//! without its own message or explanation.

/// Reason phrase for a status code, `"Unknown"` when it has none.
pub fn phrase(status: u16) -> &'static str {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
        .unwrap_or("Unknown")
}

/// Longer explanation of a status code, empty when none is known.
pub fn description(status: u16) -> &'static str {
    match status {
        100 => "Waiting for the rest of the request.",
        101 => "The server agrees to switch protocols.",
        200 => "Request processed successfully.",
        201 => "Request processed successfully and a resource was created.",
        202 => "Request accepted, with no guarantee about the outcome.",
        204 => "Request processed successfully, nothing to return.",
        301 => "The document moved permanently.",
        302 => "The document moved temporarily.",
        303 => "The answer to this request is elsewhere.",
        304 => "The document was not modified since the last request.",
        307 => "The request must be repeated at the given URI.",
        308 => "The request must be repeated at the given URI from now on.",
        400 => "The request syntax is invalid.",
        401 => "Authentication is required to access the resource.",
        403 => "Access denied, authenticating will not help.",
        404 => "Resource not found.",
        405 => "Request method not allowed for this resource.",
        406 => "The resource is not available in a format matching the Accept header.",
        408 => "The server timed out waiting for the request.",
        409 => "The request conflicts with the current state of the resource.",
        410 => "The resource is gone and no forwarding address is known.",
        411 => "The request length was not specified.",
        412 => "Preconditions sent by the request were not met.",
        413 => "The request is too large to be processed.",
        414 => "The URI is too long.",
        415 => "Unsupported request format for this method and resource.",
        417 => "The expectation given in the request header could not be met.",
        418 => "I'm a teapot.",
        422 => "The request was well formed but could not be processed.",
        429 => "Too many requests were sent in a given amount of time.",
        431 => "The request header fields are too large.",
        500 => "Internal server error.",
        501 => "The requested feature is not supported by the server.",
        502 => "The upstream server sent an invalid response.",
        503 => "Service temporarily unavailable or under maintenance.",
        504 => "The upstream server did not answer in time.",
        505 => "HTTP version not supported by the server.",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phrases() {
        assert_eq!(phrase(404), "Not Found");
        assert_eq!(phrase(500), "Internal Server Error");
        assert_eq!(phrase(799), "Unknown");
    }

    #[test]
    fn test_descriptions() {
        assert_eq!(description(404), "Resource not found.");
        assert_eq!(description(299), "");
    }
}
