//! Response header sets shared by the smart HTTP endpoints.

/// Headers preventing any intermediary from caching protocol responses.
pub const NO_CACHE: [(&str, &str); 3] = [
    ("Expires", "Fri, 01 Jan 1980 00:00:00 GMT"),
    ("Pragma", "no-cache"),
    ("Cache-Control", "no-cache, max-age=0, must-revalidate"),
];

/// Header sent with plain-text refusals so browsers do not sniff the body.
pub const NO_SNIFF: (&str, &str) = ("X-Content-Type-Options", "nosniff");

/// The `WWW-Authenticate` value challenging a client for basic credentials on `realm`.
pub fn basic_auth_challenge(realm: &str) -> String {
    format!("Basic realm=\"{realm}\"")
}
