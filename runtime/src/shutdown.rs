use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Installs a Ctrl+C / SIGINT handler and returns a flag the reactor loop
/// can poll once per iteration. Dropping the flag does not uninstall the
/// handler - there is exactly one per process.
pub fn install() -> Arc<AtomicBool> {
	let flag = Arc::new(AtomicBool::new(false));

	let set = flag.clone();
	if let Err(err) = ctrlc::set_handler(move || set.store(true, Ordering::Relaxed)) {
		log::warn!("Failed to install Ctrl+C handler: {err}");
	}

	flag
}
