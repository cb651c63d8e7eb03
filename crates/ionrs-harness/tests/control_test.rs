//! Integration test: control command dispatch.
//!
//! Run: cargo test -p ionrs-harness --test control_test

use std::sync::Arc;

use ionrs_core::{
    ALL_HEAPS, BufferFlags, Client, ControlCommand, ControlReply, CustomHandler, Device,
    DeviceConfig, HeapDescriptor, HeapKind, IonError, Result,
};
use ionrs_harness::{SimHeap, SimStats};

const MIB: usize = 1024 * 1024;

/// Command 1 reports the caller's handle count; command 2 echoes its
/// argument doubled; anything else is rejected.
struct Probe;

impl CustomHandler for Probe {
    fn handle(&self, _device: &Device, client: &Client, cmd: u32, arg: u64) -> Result<i64> {
        match cmd {
            1 => Ok(client.handle_count() as i64),
            2 => i64::try_from(arg)
                .map(|v| v * 2)
                .map_err(|_| IonError::invalid("argument too large")),
            other => Err(IonError::invalid(format!("unknown custom command {other}"))),
        }
    }
}

fn device(custom: bool) -> (Device, Arc<SimHeap>) {
    let sim = Arc::new(SimHeap::builder("system", MIB).phys_base(0x8000_0000).build());
    let mut builder = Device::builder().config(DeviceConfig::default());
    if custom {
        builder = builder.custom_handler(Arc::new(Probe));
    }
    let device = builder.build().unwrap();
    device
        .add_heap(
            HeapDescriptor::new(0, "system", HeapKind::System),
            sim.clone(),
        )
        .unwrap();
    (device, sim)
}

fn handle_of(reply: ControlReply) -> ionrs_core::HandleId {
    match reply {
        ControlReply::Handle { handle } => handle,
        other => panic!("expected a handle, got {other:?}"),
    }
}

#[test]
fn every_command_reaches_its_operation() {
    let (device, sim) = device(false);
    let owner = device.create_client("owner", Some(1)).unwrap();
    let peer = device.create_client("peer", Some(2)).unwrap();

    let handle = handle_of(
        device
            .dispatch(
                &owner,
                ControlCommand::Allocate {
                    len: 8192,
                    align: 1,
                    heap_mask: ALL_HEAPS,
                    flags: BufferFlags::CACHED,
                },
            )
            .unwrap(),
    );
    assert_eq!(sim.used(), 8192);

    let reply = device
        .dispatch(&owner, ControlCommand::Phys { handle })
        .unwrap();
    assert_eq!(
        reply,
        ControlReply::Phys {
            addr: 0x8000_0000,
            len: 8192
        }
    );

    let fd = match device
        .dispatch(&owner, ControlCommand::Share { handle })
        .unwrap()
    {
        ControlReply::Fd { fd } => fd,
        other => panic!("expected a descriptor, got {other:?}"),
    };
    assert_eq!(
        device.dispatch(&owner, ControlCommand::Sync { fd }),
        Ok(ControlReply::Done)
    );
    assert_eq!(SimStats::get(&sim.stats().whole_syncs), 1);

    let imported = handle_of(
        device
            .dispatch(&peer, ControlCommand::Import { fd })
            .unwrap(),
    );
    assert_eq!(
        device.buffer(&peer, imported).unwrap().id(),
        device.buffer(&owner, handle).unwrap().id()
    );

    assert_eq!(
        device.dispatch(&owner, ControlCommand::Free { handle }),
        Ok(ControlReply::Done)
    );
    assert_eq!(
        device.dispatch(&peer, ControlCommand::Free { handle: imported }),
        Ok(ControlReply::Done)
    );
    device.close(fd).unwrap();
    assert_eq!(sim.used(), 0);
}

#[test]
fn errors_carry_their_errno() {
    let (device, _) = device(false);
    let client = device.create_client("app", Some(1)).unwrap();
    let handle = handle_of(
        device
            .dispatch(
                &client,
                ControlCommand::Allocate {
                    len: 4096,
                    align: 1,
                    heap_mask: ALL_HEAPS,
                    flags: BufferFlags::empty(),
                },
            )
            .unwrap(),
    );
    device.dispatch(&client, ControlCommand::Free { handle }).unwrap();

    let err = device
        .dispatch(&client, ControlCommand::Free { handle })
        .unwrap_err();
    assert_eq!((err.kind(), err.errno()), ("invalid_handle", libc::EINVAL));

    let err = device
        .dispatch(
            &client,
            ControlCommand::Allocate {
                len: 4096,
                align: 1,
                heap_mask: 1 << 7,
                flags: BufferFlags::empty(),
            },
        )
        .unwrap_err();
    assert_eq!((err.kind(), err.errno()), ("no_matching_heap", libc::ENODEV));

    let err = device
        .dispatch(&client, ControlCommand::Sync { fd: ionrs_core::Fd(42) })
        .unwrap_err();
    assert_eq!((err.kind(), err.errno()), ("bad_descriptor", libc::EBADF));
}

#[test]
fn custom_commands_need_a_handler() {
    let (device, _) = device(false);
    let client = device.create_client("app", Some(1)).unwrap();
    let err = device
        .dispatch(&client, ControlCommand::Custom { cmd: 1, arg: 0 })
        .unwrap_err();
    assert!(matches!(err, IonError::Unsupported { op: "custom", .. }));
    assert_eq!(err.errno(), libc::ENOTTY);
}

#[test]
fn custom_handler_results_are_passed_through() {
    let (device, _) = device(true);
    let client = device.create_client("app", Some(1)).unwrap();
    device
        .allocate(&client, 4096, 1, ALL_HEAPS, BufferFlags::empty())
        .unwrap();

    assert_eq!(
        device.dispatch(&client, ControlCommand::Custom { cmd: 1, arg: 0 }),
        Ok(ControlReply::Custom { value: 1 })
    );
    assert_eq!(
        device.dispatch(&client, ControlCommand::Custom { cmd: 2, arg: 21 }),
        Ok(ControlReply::Custom { value: 42 })
    );
    let err = device
        .dispatch(&client, ControlCommand::Custom { cmd: 9, arg: 0 })
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_argument");
}

#[test]
fn json_commands_drive_the_device() {
    let (device, sim) = device(false);
    let client = device.create_client("app", Some(1)).unwrap();
    let command: ControlCommand =
        serde_json::from_str(r#"{"op":"allocate","len":100,"heap_mask":1}"#).unwrap();
    let handle = handle_of(device.dispatch(&client, command).unwrap());
    assert_eq!(sim.used(), 4096);

    let reply = device
        .dispatch(&client, ControlCommand::Share { handle })
        .unwrap();
    let encoded = serde_json::to_value(&reply).unwrap();
    assert_eq!(encoded["reply"], "fd");
}
