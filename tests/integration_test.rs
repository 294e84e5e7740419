// tests/integration_test.rs

mod integration {
    pub mod test_helpers;

    pub mod assessment_test;
    pub mod draining_test;
    pub mod instantiation_timeout_test;
    pub mod scaling_test;
    pub mod scheduling_test;
}
