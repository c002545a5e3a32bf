use bos_transport::{
    connect_scoped, CommandOps, ConnectTarget, FakeDevice, FakeResponse, FakeTransport, Operation,
};

fn target(host: &str) -> ConnectTarget {
    ConnectTarget::new(host, "root", Some("admin".to_string()))
}

#[test]
fn guard_closes_session_on_drop() {
    let fake = FakeTransport::new().with_device("10.0.0.5", FakeDevice::new());
    {
        let session = connect_scoped(&fake, &target("10.0.0.5")).unwrap();
        session.run(&["uname", "-a"]).unwrap();
        assert_eq!(fake.open_sessions(), 1);
    }
    assert_eq!(fake.open_sessions(), 0);
    assert_eq!(
        fake.operations().last(),
        Some(&Operation::Close {
            host: "10.0.0.5".to_string()
        })
    );
}

#[test]
fn guard_closes_session_when_an_error_unwinds() {
    let fake = FakeTransport::new().with_device(
        "10.0.0.6",
        FakeDevice::new().on_command("stage1.sh", FakeResponse::fail(1, "flash failed")),
    );
    let result = (|| {
        let session = connect_scoped(&fake, &target("10.0.0.6"))?;
        session.run_shell("cd /tmp/firmware && /bin/sh stage1.sh")?;
        Ok::<_, bos_transport::TransportError>(())
    })();
    assert!(result.is_err());
    assert_eq!(fake.open_sessions(), 0);
}

#[test]
fn explicit_close_is_recorded_once() {
    let fake = FakeTransport::new().with_device("h", FakeDevice::new());
    let session = connect_scoped(&fake, &target("h")).unwrap();
    session.close().unwrap();
    let closes = fake
        .operations()
        .iter()
        .filter(|op| matches!(op, Operation::Close { .. }))
        .count();
    assert_eq!(closes, 1);
}

#[test]
fn recovery_reconnection_skips_host_key_verification() {
    let fake = FakeTransport::new().with_device("h", FakeDevice::new());
    drop(connect_scoped(&fake, &target("h")).unwrap());
    drop(connect_scoped(&fake, &target("h").without_host_key_verification()).unwrap());
    assert_eq!(fake.connections("h"), vec![true, false]);
}
