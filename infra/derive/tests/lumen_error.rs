#[test]
fn lumen_error_ui() {
    let t = trybuild::TestCases::new();
    t.pass("tests/ui/lumen_error_pass.rs");
    t.pass("tests/ui/lumen_error_optional_cause.rs");
}
