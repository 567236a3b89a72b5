#[test]
fn ui_pass() {
    let t = trybuild::TestCases::new();
    t.pass("tests/ui/listener_basic.rs");
    t.pass("tests/ui/listener_custom_names.rs");
    t.pass("tests/ui/listener_fallible.rs");
}
