#[cfg(feature = "random")]
pub mod random;
