//! Panic capture for job code.
//!
//! A panic inside a job is reported like any other job failure, with its
//! message, location and a backtrace. The worker's panic hook records that
//! information for the thread that panicked; panics outside job code are
//! logged and handed to the previous hook.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Once;

/// What a job panic left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanicReport {
    pub message: String,
    pub location: Option<String>,
    pub backtrace: Option<String>,
}

impl fmt::Display for PanicReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "job panicked at {}:\n{}", location, self.message),
            None => write!(f, "job panicked:\n{}", self.message),
        }
    }
}

thread_local! {
    static CAPTURING: Cell<bool> = const { Cell::new(false) };
    static LAST_PANIC: RefCell<Option<PanicReport>> = const { RefCell::new(None) };
}

static INSTALL: Once = Once::new();

fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

/// Install the worker's panic hook. Later calls do nothing.
pub fn install_hook() {
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if CAPTURING.with(Cell::get) {
                let report = PanicReport {
                    message: payload_message(info.payload()),
                    location: info.location().map(|l| l.to_string()),
                    backtrace: Some(Backtrace::force_capture().to_string()),
                };
                LAST_PANIC.with(|slot| *slot.borrow_mut() = Some(report));
            } else {
                tracing::error!(panic = %info, "uncaught panic");
                previous(info);
            }
        }));
    });
}

/// Run `f`, turning a panic into a [`PanicReport`].
pub fn catch<R>(f: impl FnOnce() -> R) -> Result<R, PanicReport> {
    install_hook();
    let was_capturing = CAPTURING.with(|c| c.replace(true));
    let result = panic::catch_unwind(AssertUnwindSafe(f));
    CAPTURING.with(|c| c.set(was_capturing));

    result.map_err(|payload| {
        LAST_PANIC
            .with(|slot| slot.borrow_mut().take())
            .unwrap_or_else(|| PanicReport {
                message: payload_message(payload.as_ref()),
                location: None,
                backtrace: None,
            })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catch_returns_value() {
        assert_eq!(catch(|| 21 * 2), Ok(42));
    }

    #[test]
    fn test_catch_reports_message_and_location() {
        let report = catch(|| -> u32 { panic!("disk on fire: {}", 7) }).unwrap_err();
        assert_eq!(report.message, "disk on fire: 7");
        assert!(report.location.as_deref().unwrap().contains("panic.rs"));
        assert!(report.backtrace.is_some());
        assert!(report.to_string().starts_with("job panicked at "));
    }

    #[test]
    fn test_static_str_payload() {
        let report = catch(|| std::panic::panic_any("plain")).unwrap_err();
        assert_eq!(report.message, "plain");
    }
}
