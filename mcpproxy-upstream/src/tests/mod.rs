//! Integration tests for the client and manager, driven through mock
//! transports behind the [`crate::transport::TransportFactory`] seam.

mod manager_test;
mod support;
