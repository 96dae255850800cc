//! Schema discovery through server reflection.

mod common;

use std::sync::Arc;

use common::{Options, WEATHER_GET};
use grpcweb_client::{CallOptions, Client, ClientError, ConnectParams, EventLoop, HostContext};
use serde_json::json;

fn executing() -> Client {
    let ctx = HostContext::new(".");
    ctx.enter_execution();
    Client::builder(EventLoop::new(), Arc::new(ctx)).build().unwrap()
}

#[test]
fn test_reflect_registers_methods() {
    let server = common::start();
    let mut client = executing();

    let methods = client
        .connect(&server.url(), ConnectParams::new().reflect(true))
        .unwrap();
    let paths: Vec<_> = methods.iter().map(|m| m.full_method.as_str()).collect();
    assert_eq!(
        paths,
        vec!["/weather.Weather/Get", "/weather.Weather/Slow", "/weather.Weather/Watch"]
    );
    let watch = methods.iter().find(|m| m.name == "Watch").unwrap();
    assert!(watch.is_server_stream);
    assert!(!watch.is_client_stream);
    assert_eq!(watch.package, "weather");

    // Dependencies came along with the service file.
    let pool = client.store().pool();
    assert!(pool.get_file_by_name("common/location.proto").is_some());
    assert!(pool.get_file_by_name("google/protobuf/timestamp.proto").is_some());

    let response = client
        .invoke(
            WEATHER_GET,
            &json!({ "location": { "city": "Lima" } }),
            CallOptions::new(),
        )
        .unwrap();
    assert!(response.is_ok());
    assert_eq!(response.message["location"]["city"], "Lima");
}

#[test]
fn test_reflect_is_additive() {
    let server = common::start();
    let mut client = executing();

    client
        .connect(&server.url(), ConnectParams::new().reflect(true))
        .unwrap();
    client
        .connect(&server.url(), ConnectParams::new().reflect(true))
        .unwrap();
    assert_eq!(client.methods().len(), 3);
}

#[test]
fn test_reflect_without_reflection_service() {
    let server = common::start_with(Options::default());
    let mut client = executing();

    let err = client
        .connect(&server.url(), ConnectParams::new().reflect(true))
        .unwrap_err();
    assert!(matches!(err, ClientError::Discovery(_)), "got {err:?}");
}

#[test]
fn test_reflect_terminates_on_import_cycle() {
    let server = common::start_with(Options {
        reflection: true,
        cyclic: true,
    });
    let mut client = executing();

    let methods = client
        .connect(&server.url(), ConnectParams::new().reflect(true))
        .unwrap();
    let paths: Vec<_> = methods.iter().map(|m| m.full_method.as_str()).collect();
    assert_eq!(paths, vec!["/ring.Ring/Spin"]);

    let pool = client.store().pool();
    assert!(pool.get_file_by_name("ring/a.proto").is_some());
    assert!(pool.get_file_by_name("ring/b.proto").is_some());
    // a.proto came with the symbol lookup; only b.proto is fetched by name.
    assert_eq!(server.fetched_files(), vec!["ring/b.proto"]);
}

#[test]
fn test_connect_params_from_value() {
    let params = ConnectParams::try_from(&json!({ "reflect": true })).unwrap();
    assert!(params.get_reflect());

    let err = ConnectParams::try_from(&json!({ "reflect": "yes" })).unwrap_err();
    assert!(matches!(err, ClientError::InvalidArgument(_)));

    let err = ConnectParams::try_from(&json!({ "plaintext": true })).unwrap_err();
    assert!(matches!(err, ClientError::InvalidArgument(_)));
}
