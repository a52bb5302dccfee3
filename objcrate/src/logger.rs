//! Process-global logging callback.
//!
//! The reference interface takes a C variadic `printf`-style callback plus an opaque user
//! pointer. The idiomatic shape here is a boxed closure behind a `Mutex`: the crate formats
//! the message (function name prefix included) before the callback ever sees it, so the
//! callback itself only has to deal with a plain `&str`.

use std::sync::Mutex;
use std::sync::OnceLock;

type Callback = Box<dyn Fn(&str) + Send + Sync + 'static>;

static LOGGER: OnceLock<Mutex<Option<Callback>>> = OnceLock::new();

fn slot() -> &'static Mutex<Option<Callback>> {
	LOGGER.get_or_init(|| Mutex::new(None))
}

/// Sets the process-wide logger callback. Passing `None` disables logging, which is also the
/// default.
pub fn set_logger<F>(callback: Option<F>)
where
	F: Fn(&str) + Send + Sync + 'static,
{
	let boxed: Option<Callback> = callback.map(|f| Box::new(f) as Callback);
	*slot().lock().unwrap() = boxed;
}

/// Invokes the logger, if one is set, with a message prefixed by `func`. Best-effort: never
/// fails the caller, and a poisoned lock is treated as "no logger".
pub(crate) fn log(func: &str, args: std::fmt::Arguments<'_>) {
	if let Ok(guard) = slot().lock() {
		if let Some(cb) = guard.as_ref() {
			cb(&format!("{func}(): {args}"));
		}
	}
}

/// Logs a message prefixed with the name of the function passed as the first argument,
/// mirroring the reference interface's `log(fmt, ...)` macro (which uses `__func__`).
macro_rules! crate_log {
	($func:expr, $($arg:tt)*) => {
		$crate::logger::log($func, format_args!($($arg)*))
	};
}

pub(crate) use crate_log;

#[cfg(test)]
mod test {
	use super::*;
	use std::sync::atomic::AtomicUsize;
	use std::sync::atomic::Ordering;
	use std::sync::Arc;

	#[test]
	fn callback_receives_formatted_message() {
		let counter = Arc::new(AtomicUsize::new(0));
		let counter2 = counter.clone();
		set_logger(Some(move |msg: &str| {
			assert!(msg.contains("hello"));
			counter2.fetch_add(1, Ordering::SeqCst);
		}));
		log("test_fn", format_args!("hello {}", 42));
		assert_eq!(counter.load(Ordering::SeqCst), 1);
		set_logger::<fn(&str)>(None);
	}
}
