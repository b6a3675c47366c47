use lumen_derive::lumen_error;
use std::borrow::Cow;

type Cause = Box<dyn std::error::Error + Send + Sync>;

#[lumen_error(fallback = Failed)]
pub enum DemoError {
    #[error("Denied{}: {message}", format_context(.context))]
    Denied { message: Cow<'static, str>, context: Option<Cow<'static, str>>, source: Option<Cause> },

    #[error("Failed{}: {message}", format_context(.context))]
    Failed { message: Cow<'static, str>, context: Option<Cow<'static, str>>, source: Option<Cause> },
}

fn main() {
    let err: DemoError = String::from("boom").into();
    assert!(err.is_failed());
    let err: Result<(), DemoError> = Err(err);
    let err = err.context("while testing").unwrap_err();
    assert_eq!(err.to_string(), "Failed (while testing): boom");
}
