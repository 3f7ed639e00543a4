mod common;

use std::sync::Arc;

use aether_compute::{ComputeError, ErrorKind, Iproute2Network};
use common::RecordingRunner;

fn network(runner: &Arc<RecordingRunner>, sudo: bool) -> Iproute2Network {
    Iproute2Network::new(runner.clone(), sudo)
}

#[tokio::test]
async fn invalid_names_never_reach_the_host() {
    let runner = Arc::new(RecordingRunner::default());
    let net = network(&runner, true);

    for name in ["", "br 0", "br0;reboot", "../eth0", "averyveryverylongname"] {
        let err = net.create_bridge(name).await.expect_err(name);
        assert_eq!(err.kind(), ErrorKind::Validation, "{name}: {err}");
    }
    assert!(net.create_tap("tap0", "Root", None).await.is_err());
    assert!(net.create_tap("tap0", "aether", Some("br 0")).await.is_err());
    assert!(net
        .bridged_network("br0", "eth0", Some("10.0.0.2/24; rm"), None)
        .await
        .is_err());
    assert!(net.device_exists("eth0 up").await.is_err());

    assert!(runner.calls().is_empty(), "calls: {:?}", runner.calls());
}

#[tokio::test]
async fn existing_bridge_is_left_alone() {
    let runner = Arc::new(RecordingRunner::with_devices(&["br0"]));
    let net = network(&runner, true);

    net.create_bridge("br0").await.expect("bridge exists");
    assert_eq!(runner.calls(), vec!["ip link show dev br0"]);
    assert!(runner.mutations().is_empty());
}

#[tokio::test]
async fn new_bridge_is_created_and_raised() {
    let runner = Arc::new(RecordingRunner::default());
    let net = network(&runner, false);

    net.create_bridge("br0").await.expect("create bridge");
    assert_eq!(
        runner.mutations(),
        vec!["ip link add br0 type bridge", "ip link set br0 up"]
    );
}

#[tokio::test]
async fn tap_with_sudo_and_bridge() {
    let runner = Arc::new(RecordingRunner::default());
    let net = network(&runner, true);

    net.create_tap("tap-vde", "aether", Some("br0"))
        .await
        .expect("create tap");
    assert_eq!(
        runner.mutations(),
        vec![
            "sudo ip tuntap add dev tap-vde mode tap user aether",
            "sudo ip link set dev tap-vde up",
            "sudo ip link set tap-vde master br0",
        ]
    );
    assert!(
        runner.calls()[0].starts_with("ip link show"),
        "existence checks run without sudo"
    );
}

#[tokio::test]
async fn existing_tap_is_left_alone() {
    let runner = Arc::new(RecordingRunner::with_devices(&["tap-vde"]));
    let net = network(&runner, true);
    net.create_tap("tap-vde", "aether", None).await.expect("tap exists");
    assert!(runner.mutations().is_empty());
}

#[tokio::test]
async fn failed_step_aborts_the_chain() {
    let runner = Arc::new(RecordingRunner::default());
    runner.fail_on("ip link set dev tap0 up");
    let net = network(&runner, false);

    let err = net
        .create_tap("tap0", "aether", Some("br0"))
        .await
        .expect_err("second step fails");
    let ComputeError::ExternalTool { tool, reason } = &err else {
        panic!("expected tool failure, got {err:?}");
    };
    assert_eq!(tool, "ip");
    assert!(reason.contains("Operation not permitted"), "{reason}");
    assert_eq!(
        runner.mutations(),
        vec!["ip tuntap add dev tap0 mode tap user aether", "ip link set dev tap0 up"],
        "no step may run after the failing one"
    );
}

#[tokio::test]
async fn bridged_network_moves_address_and_route() {
    let runner = Arc::new(RecordingRunner::default());
    let net = network(&runner, true);

    net.bridged_network("br0", "eth0", Some("10.0.0.2/24"), Some("10.0.0.1"))
        .await
        .expect("bridged network");
    assert_eq!(
        runner.mutations(),
        vec![
            "sudo ip link add br0 type bridge",
            "sudo ip link set br0 up",
            "sudo ip link set eth0 up",
            "sudo ip link set eth0 master br0",
            "sudo ip addr flush dev eth0",
            "sudo ip addr flush dev br0",
            "sudo ip addr add 10.0.0.2/24 dev br0",
            "sudo ip route add default via 10.0.0.1 dev br0",
        ]
    );
}

#[tokio::test]
async fn bridged_network_without_address_keeps_it_on_host() {
    let runner = Arc::new(RecordingRunner::with_devices(&["br0"]));
    let net = network(&runner, false);

    net.bridged_network("br0", "eth0", None, None)
        .await
        .expect("bridged network");
    assert_eq!(
        runner.mutations(),
        vec![
            "ip link set eth0 up",
            "ip link set eth0 master br0",
            "ip addr flush dev eth0",
        ]
    );
}
