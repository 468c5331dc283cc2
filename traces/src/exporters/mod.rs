#[cfg(feature = "stdout")]
pub mod stdout;
