//! Helper macros enforcing consistent route log fields.
//!
//! These macros keep `route` (and optionally `node`) fields present on every log
//! emitted from processors so downstream parsing can rely on them.

/// Log an event for a route/node pair plus any extra fields.
#[macro_export]
macro_rules! route_event {
    ($level:ident, $target:expr, $event:expr, route = $route:expr, node = $node:expr $(, $field:ident = $value:expr )* $(,)?) => {
        tracing::$level!(
            target: $target,
            event = $event,
            route = %$route,
            node = %$node,
            $($field = %$value,)*
        )
    };
    ($level:ident, $target:expr, $event:expr, route = $route:expr $(, $field:ident = $value:expr )* $(,)?) => {
        tracing::$level!(
            target: $target,
            event = $event,
            route = %$route,
            $($field = %$value,)*
        )
    };
}
