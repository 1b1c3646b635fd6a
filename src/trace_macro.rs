/*
 * @copyright (C) 2024 Ruslan Iusupov <https://github.com/rus0000>
 *
 * SPDX-License-Identifier: MIT
 */

/// Empty list traces nothing, `u32::MAX` disables tracing too, otherwise only listed connection ids are traced.
pub fn check_trace_connection(trace_connections: &[u32], connection_id: u32) -> bool {
    !trace_connections.is_empty() && (trace_connections.contains(&connection_id) || trace_connections.contains(&0))
}

/// Per-connection trace through the `log` facade.
/// The pattern must start with `[{}]:`, which receives the connection id.
#[macro_export]
macro_rules! trace {
    ($format_pattern: expr, $trace_connections: expr, $connection_id: expr $(, $arg: expr)* $(,)?) => {
        if $crate::trace_macro::check_trace_connection($trace_connections, $connection_id) {
            ::log::debug!($format_pattern, $connection_id $(, $arg)*);
        };
    };
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_trace_filter() {
        assert!(!check_trace_connection(&[], 1));
        assert!(check_trace_connection(&[1, 3], 3));
        assert!(!check_trace_connection(&[1, 3], 2));
        assert!(check_trace_connection(&[0], 7));
        assert!(!check_trace_connection(&[u32::MAX], 7));
    }
}
