//! Chaos/failpoint hooks (feature: `failpoints`).
//!
//! The macro expands to nothing unless the feature is enabled. When enabled,
//! a point panics while it is armed on the current thread.

#[cfg(feature = "failpoints")]
use std::cell::RefCell;
#[cfg(feature = "failpoints")]
use std::collections::HashSet;

#[cfg(feature = "failpoints")]
thread_local! {
    static ARMED: RefCell<HashSet<String>> = RefCell::new(HashSet::new());
}

#[cfg(feature = "failpoints")]
pub fn arm(name: &str) {
    ARMED.with(|a| a.borrow_mut().insert(name.to_string()));
}

#[cfg(feature = "failpoints")]
pub fn disarm(name: &str) {
    ARMED.with(|a| a.borrow_mut().remove(name));
}

#[cfg(feature = "failpoints")]
pub fn is_armed(name: &str) -> bool {
    ARMED.with(|a| a.borrow().contains(name))
}

#[cfg(feature = "failpoints")]
#[macro_export]
macro_rules! fail_point {
    ($name:expr) => {{
        if $crate::failpoints::is_armed($name) {
            panic!("failpoint triggered: {}", $name);
        }
    }};
}

#[cfg(not(feature = "failpoints"))]
#[macro_export]
macro_rules! fail_point {
    ($name:expr) => {{
        // no-op
        let _ = $name;
    }};
}
