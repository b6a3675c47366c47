#![allow(unreachable_pub)]
#![allow(clippy::needless_pass_by_value)]

//! # Macros
//!
//! Procedural macros shared by the Lumen infrastructure crates.
//!
//! ## Usage
//! ```toml
//! [dependencies]
//! lumen-derive = { path = "../infra/derive" }
//! thiserror = "2"
//! ```
//!
//! Examples are `ignore`d here because a proc-macro crate cannot invoke its own macros.

mod macros;

use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

/// Turns a plain enum into a fully wired error type.
///
/// # Generated Items
///
/// * `#[derive(Debug, thiserror::Error)]` unless already derived.
/// * A `<Name>Ext` trait adding `.context(...)` to `Result<T, Name>` and, for every variant with
///   a **mandatory** source, to `Result<T, Source>` as well.
/// * `From<Source>` for variants with a mandatory source. Optional causes
///   (`source: Option<...>`) are attached explicitly and get no conversion.
/// * `From<&'static str>` and `From<String>` into the variant named by `fallback = ...`
///   (which must carry a `message: Cow<'static, str>` field).
/// * An `is_<variant>()` predicate per variant.
/// * A private `format_context` helper used by the `#[error(...)]` strings.
///
/// # Requirements
///
/// 1. Applied to an enum whose variants all have named fields.
/// 2. A `context` field, when present, must be `Option<Cow<'static, str>>`.
/// 3. Variants with a mandatory source must also have a `context` field.
///
/// # Example
///
/// ```rust,ignore
/// use lumen_derive::lumen_error;
/// use std::borrow::Cow;
///
/// #[lumen_error(fallback = Failed)]
/// pub enum DemoError {
///     #[error("I/O error{}: {source}", format_context(.context))]
///     Io { source: std::io::Error, context: Option<Cow<'static, str>> },
///
///     #[error("Operation failed{}: {message}", format_context(.context))]
///     Failed { message: Cow<'static, str>, context: Option<Cow<'static, str>> },
/// }
///
/// fn load() -> Result<Vec<u8>, DemoError> {
///     let bytes = std::fs::read("payload.bin").context("Reading payload")?;
///     if bytes.is_empty() {
///         return Err("Payload is empty".into());
///     }
///     Ok(bytes)
/// }
/// ```
#[proc_macro_attribute]
pub fn lumen_error(args: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as DeriveInput);
    macros::error::expand(args.into(), input).into()
}
