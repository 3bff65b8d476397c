mod support;

mod dispatcher_tests;
mod keys_tests;
mod validation_tests;
