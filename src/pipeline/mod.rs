//! Pipeline stages for scanned-bundle ingestion.
//!
//! Each submodule implements exactly one step. Stages share plain data
//! types from [`crate::model`] and never call each other directly; the
//! orchestration lives in [`crate::ingest`].
//!
//! ## Data Flow
//!
//! ```text
//! hash ──▶ split ──▶ qr ──▶ route ──▶ idbox ──▶ classify
//! (sha256)  (pdfium)  (rqrr)  (state)   (crop)    (digits)
//! ```
//!
//! 1. [`hash`]     content digests of bundles and page images
//! 2. [`split`]    rasterise a bundle into one greyscale PNG per page; runs
//!    in `spawn_blocking` because pdfium is not async-safe
//! 3. [`qr`]       read the QR codes on a page and classify the payloads
//! 4. [`route`]    per-page state machine and duplicate detection
//! 5. [`idbox`]    crop the student-number box from an ID page
//! 6. [`classify`] adapter around a pluggable digit classifier

pub mod classify;
pub mod hash;
pub mod idbox;
pub mod qr;
pub mod route;
pub mod split;
