//! Distributed linear algebra.

pub mod qr;

pub use qr::{Qr, QrError, QrMode, QrOptions, qr};
