//! Sticky-session token extraction.
//!
//! A session token is read from the balancer's sticky cookie, or, when
//! the cookie is absent, from a `;name=value` path parameter. Tokens
//! follow the `sessionid.route` convention.

use clusterlb_core::limits::SESSIONID_SIZE;
use clusterlb_state::Balancer;

/// Session token presented by a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StickySession {
    pub id: String,
}

impl StickySession {
    /// Route suffix after the first `.`, if any.
    pub fn route(&self) -> Option<&str> {
        self.id
            .split_once('.')
            .map(|(_, route)| route)
            .filter(|route| !route.is_empty())
    }
}

/// Value of cookie `name` in a `Cookie` header.
pub fn cookie_value<'a>(cookies: &'a str, name: &str) -> Option<&'a str> {
    cookies.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key.trim() == name).then(|| value.trim().trim_matches('"'))
    })
}

/// Value of the `;name=value` path parameter of `uri`.
pub fn path_parameter<'a>(uri: &'a str, name: &str) -> Option<&'a str> {
    let path = uri.split_once('?').map_or(uri, |(path, _)| path);
    path.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if key != name {
            return None;
        }
        let end = value.find(['/', '&', '#']).unwrap_or(value.len());
        Some(&value[..end])
    })
}

/// Session token for `balancer`, cookie first, then path parameter.
pub fn find_session(cookies: Option<&str>, uri: &str, balancer: &Balancer) -> Option<StickySession> {
    cookies
        .and_then(|c| cookie_value(c, &balancer.sticky_cookie))
        .filter(|v| !v.is_empty())
        .or_else(|| path_parameter(uri, &balancer.sticky_path))
        .filter(|v| !v.is_empty() && v.len() < SESSIONID_SIZE)
        .map(|v| StickySession { id: v.to_string() })
}
