//! Field size limits.
//!
//! Each constant is the size of the fixed character buffer the field
//! occupies in the shared record layout, terminator included. A value
//! fits when its byte length is strictly below the size.

pub const BALANCER_SIZE: usize = 40;
pub const JVMROUTE_SIZE: usize = 64;
pub const DOMAIN_SIZE: usize = 20;
pub const HOST_SIZE: usize = 64;
pub const PORT_SIZE: usize = 7;
pub const TYPE_SIZE: usize = 16;
pub const AJPSECRET_SIZE: usize = 64;
pub const UPGRADE_SIZE: usize = 16;
pub const CONTEXT_SIZE: usize = 80;
pub const ALIAS_SIZE: usize = 100;
pub const SESSIONID_SIZE: usize = 128;
pub const COOKIE_NAME_SIZE: usize = 30;
pub const PATH_NAME_SIZE: usize = 30;

/// Route written over a node's JVMRoute when it is replaced by a node
/// with the same route but different addressing.
pub const REMOVED_ROUTE: &str = "REMOVED";

/// Whether `value` fits a buffer of `size` bytes.
pub fn fits(value: &str, size: usize) -> bool {
    value.len() < size
}

/// Truncate `value` so it fits a buffer of `size` bytes, cutting on a
/// char boundary.
pub fn truncate(value: &str, size: usize) -> String {
    if fits(value, size) {
        return value.to_string();
    }
    let mut end = size.saturating_sub(1);
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fits_excludes_terminator_byte() {
        assert!(fits("abc", 4));
        assert!(!fits("abcd", 4));
        assert!(fits(&"r".repeat(63), JVMROUTE_SIZE));
        assert!(!fits(&"r".repeat(64), JVMROUTE_SIZE));
    }

    #[test]
    fn truncate_keeps_short_values() {
        assert_eq!(truncate("node1", JVMROUTE_SIZE), "node1");
    }

    #[test]
    fn truncate_cuts_to_buffer() {
        assert_eq!(truncate("abcdef", 4), "abc");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        // 'é' is two bytes; cutting at byte 3 would split it.
        assert_eq!(truncate("abé", 4), "ab");
    }
}
