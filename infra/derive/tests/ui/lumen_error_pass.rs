use lumen_derive::lumen_error;
use std::borrow::Cow;

#[lumen_error(fallback = Failed)]
pub enum DemoError {
    #[error("IO error{}: {source}", format_context(.context))]
    Io {
        #[source]
        source: std::io::Error,
        context: Option<Cow<'static, str>>,
    },

    #[error("Failed{}: {message}", format_context(.context))]
    Failed { message: Cow<'static, str>, context: Option<Cow<'static, str>> },
}

fn read() -> Result<Vec<u8>, DemoError> {
    let data = std::fs::read("missing.bin").context("Reading fixture")?;
    if data.is_empty() {
        return Err("empty".into());
    }
    Ok(data)
}

fn main() {
    let err = read().unwrap_err();
    assert!(err.is_io());
    assert!(!err.is_failed());
}
