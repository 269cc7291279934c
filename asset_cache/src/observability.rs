//! Process-wide sticky error: the last fatal condition seen by any
//! conversion worker, kept until a caller clears it.

use std::panic::{self, PanicHookInfo};
use std::sync::{Mutex, MutexGuard, OnceLock};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StickyError {
    pub origin: String,
    pub message: String,
}

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn sticky_cell() -> &'static Mutex<Option<StickyError>> {
    static STICKY: OnceLock<Mutex<Option<StickyError>>> = OnceLock::new();
    STICKY.get_or_init(|| Mutex::new(None))
}

pub fn set_sticky_error(origin: impl Into<String>, message: impl Into<String>) {
    let error = StickyError {
        origin: origin.into(),
        message: message.into(),
    };
    tracing::error!(origin = %error.origin, "{}", error.message);
    let mut guard = lock_unpoisoned(sticky_cell());
    *guard = Some(error);
}

pub fn clear_sticky_error() {
    let mut guard = lock_unpoisoned(sticky_cell());
    *guard = None;
}

pub fn sticky_error() -> Option<StickyError> {
    let guard = lock_unpoisoned(sticky_cell());
    guard.clone()
}

/// Records panics on any thread as the sticky error before the default
/// hook runs. Installing twice is a no-op.
pub fn install_panic_hook() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    if INSTALLED.set(()).is_err() {
        return;
    }
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        let origin = std::thread::current()
            .name()
            .unwrap_or("<unnamed>")
            .to_string();
        set_sticky_error(origin, format_panic(info));
        default_hook(info);
    }));
}

pub(crate) fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn format_panic(info: &PanicHookInfo<'_>) -> String {
    let payload = panic_payload_to_string(info.payload());
    let location = info
        .location()
        .map(|loc| format!("{}:{}", loc.file(), loc.line()))
        .unwrap_or_else(|| "<unknown>".to_string());
    format!("panic at {}: {}", location, payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_strings_are_extracted() {
        let owned: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        let borrowed: Box<dyn std::any::Any + Send> = Box::new("borrowed");
        let other: Box<dyn std::any::Any + Send> = Box::new(7u32);
        assert_eq!(panic_payload_to_string(owned.as_ref()), "owned");
        assert_eq!(panic_payload_to_string(borrowed.as_ref()), "borrowed");
        assert_eq!(panic_payload_to_string(other.as_ref()), "unknown panic payload");
    }

    #[test]
    fn lock_survives_poisoning() {
        let mutex = std::sync::Arc::new(Mutex::new(1));
        let poisoner = std::sync::Arc::clone(&mutex);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison");
        })
        .join();
        assert!(mutex.is_poisoned());
        assert_eq!(*lock_unpoisoned(&mutex), 1);
    }
}
