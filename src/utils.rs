use indicatif::ProgressStyle;

pub(crate) fn hex(bytes: &[u8]) -> String {
	use std::fmt::Write;
	let mut acc = String::with_capacity(bytes.len() * 2);

	for byte in bytes {
		// Writing into a String never fails.
		let _ = write!(&mut acc, "{:02x}", byte);
	}

	acc
}

pub(crate) fn get_style_run() -> Result<ProgressStyle, indicatif::style::TemplateError> {
	Ok(ProgressStyle::default_bar()
		.template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
		.progress_chars("=>-"))
}

pub(crate) fn get_style_task() -> Result<ProgressStyle, indicatif::style::TemplateError> {
	ProgressStyle::default_spinner().template("{spinner:.blue} {msg}")
}

/// Installs a `tracing` subscriber that prints through the progress bars.
///
/// The filter is read from `RUST_LOG` and defaults to `info`.
#[cfg(feature = "logging")]
pub fn init_logging() -> Result<(), crate::TsumikiError> {
	use tracing_indicatif::IndicatifLayer;
	use tracing_subscriber::layer::SubscriberExt;
	use tracing_subscriber::util::SubscriberInitExt;
	use tracing_subscriber::{EnvFilter, fmt};

	let indicatif = IndicatifLayer::new();
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

	tracing_subscriber::registry()
		.with(filter)
		.with(fmt::layer().with_writer(indicatif.get_stderr_writer()))
		.with(indicatif)
		.try_init()?;

	Ok(())
}

/// Unique scratch directory for filesystem tests, removed on drop.
#[cfg(test)]
pub(crate) struct Scratch(camino::Utf8PathBuf);

#[cfg(test)]
impl Scratch {
	pub(crate) fn new(name: &str) -> Self {
		use std::sync::atomic::{AtomicUsize, Ordering};
		static NEXT: AtomicUsize = AtomicUsize::new(0);

		let dir = std::env::temp_dir().join(format!(
			"tsumiki-{name}-{}-{}",
			std::process::id(),
			NEXT.fetch_add(1, Ordering::Relaxed)
		));
		let dir = camino::Utf8PathBuf::from_path_buf(dir).expect("temp dir is not UTF-8");
		let _ = std::fs::remove_dir_all(&dir);
		std::fs::create_dir_all(&dir).expect("can't create scratch dir");
		Self(dir)
	}
}

#[cfg(test)]
impl std::ops::Deref for Scratch {
	type Target = camino::Utf8Path;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

#[cfg(test)]
impl Drop for Scratch {
	fn drop(&mut self) {
		let _ = std::fs::remove_dir_all(&self.0);
	}
}
