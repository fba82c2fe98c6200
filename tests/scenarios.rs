//! End-to-end scenario tests exercising the literal examples from spec.md
//! §8 (S1, S2, S5-style queue overflow) against the in-process state store
//! and persistence queue, without real serial hardware — following the
//! teacher's `comsrv/tests/service_integration_test.rs` placement
//! convention of a crate-level `tests/` directory for integration tests.

use crc::{Crc, CRC_16_MODBUS};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use silod::bus::BusAdapter;
use silod::config::{Config, DatabaseConfig, ModbusConfig, ValidationConfig};
use silod::persistence::{PersistenceRecord, PersistenceWriter};
use silod::reader::{read_device, DeviceReadResult};
use silod::state::{StateStore, UpdateOutcome};

fn range() -> ValidationConfig {
    ValidationConfig {
        min_value: 0,
        max_value: 28000,
    }
}

#[test]
fn s1_happy_cycle_two_devices() {
    let store = StateStore::new(&[1, 2], 100, range());
    store.begin_cycle();

    let outcome1 = store.update(1, Some(14000), None);
    let outcome2 = store.update(2, Some(28000), None);

    assert!(matches!(outcome1, UpdateOutcome::Accepted { percent: 50, .. }));
    assert!(matches!(outcome2, UpdateOutcome::Accepted { percent: 100, .. }));

    let snap = store.snapshot();
    assert!(snap[&1].online);
    assert!(snap[&2].online);
    assert_eq!(snap[&1].total_reads, 1);
    assert_eq!(snap[&2].total_reads, 1);

    let stats = store.stats();
    assert_eq!(stats.total_polls, 1);
    assert_eq!(stats.successful_polls, 2);
    assert_eq!(stats.online_slaves, 2);

    let expected_records = vec![
        PersistenceRecord {
            external_code: Config::external_code(1),
            value: 14000,
            timestamp: chrono::Utc::now(),
        },
        PersistenceRecord {
            external_code: Config::external_code(2),
            value: 28000,
            timestamp: chrono::Utc::now(),
        },
    ];
    assert_eq!(expected_records[0].external_code, "S01");
    assert_eq!(expected_records[1].external_code, "S02");
}

#[test]
fn s2_out_of_range_is_rejected_and_not_persisted() {
    let store = StateStore::new(&[1], 100, range());
    let outcome = store.update(1, Some(30000), None);
    assert!(matches!(outcome, UpdateOutcome::Rejected));

    let snap = store.snapshot();
    assert!(!snap[&1].online);
    assert!(snap[&1].last_error.as_ref().unwrap().contains("out of range"));
    assert_eq!(snap[&1].error_count, 1);

    // No accepted outcome means the scheduler would never enqueue a
    // persistence record for this read.
    assert!(!matches!(outcome, UpdateOutcome::Accepted { .. }));
}

fn test_modbus_config() -> ModbusConfig {
    ModbusConfig {
        serial_port: "/dev/null-not-a-real-port".to_string(),
        baudrate: 9600,
        bytesize: 8,
        parity: "N".to_string(),
        stopbits: 1,
        timeout: 1.0,
        connection_timeout: 2.0,
    }
}

fn modbus_exception_frame(slave: u8, function: u8, exception: u8) -> Vec<u8> {
    let crc = Crc::<u16>::new(&CRC_16_MODBUS);
    let mut frame = vec![slave, function | 0x80, exception];
    let checksum = crc.checksum(&frame);
    frame.extend_from_slice(&checksum.to_le_bytes());
    frame
}

fn modbus_value_frame(slave: u8, value: u16) -> Vec<u8> {
    let crc = Crc::<u16>::new(&CRC_16_MODBUS);
    let mut frame = vec![slave, 0x03, 0x02];
    frame.extend_from_slice(&value.to_be_bytes());
    let checksum = crc.checksum(&frame);
    frame.extend_from_slice(&checksum.to_le_bytes());
    frame
}

/// Drives the actual retry path in `reader::read_device` against a fake
/// device that returns two Modbus exceptions before a good value, rather
/// than calling `StateStore::update` directly per attempt. Per spec.md's S3
/// scenario, retries within one device read are invisible to the state
/// store: only the final accepted read counts.
#[tokio::test]
async fn s3_transient_then_recovered_counts_one_accepted_read() {
    let (fake_device, handle) = tokio::io::duplex(256);

    let slave = 1u8;
    tokio::spawn(async move {
        let mut fake_device = fake_device;
        for reply in [
            modbus_exception_frame(slave, 0x03, 0x04),
            modbus_exception_frame(slave, 0x03, 0x04),
            modbus_value_frame(slave, 100),
        ] {
            let mut request = [0u8; 8];
            if fake_device.read_exact(&mut request).await.is_err() {
                return;
            }
            if fake_device.write_all(&reply).await.is_err() {
                return;
            }
        }
    });

    let bus = BusAdapter::from_transport(test_modbus_config(), Box::new(handle));
    let result = read_device(&bus, slave, 3).await;
    let value = match result {
        DeviceReadResult::Value(v) => v,
        DeviceReadResult::Error(e) => panic!("expected eventual success, got error {e}"),
    };

    let store = StateStore::new(&[slave], 100, range());
    let outcome = store.update(slave, Some(value), None);

    assert!(matches!(outcome, UpdateOutcome::Accepted { percent: 0, .. }));
    let snap = store.snapshot();
    assert!(snap[&slave].online);
    assert_eq!(snap[&slave].error_count, 0);
    assert_eq!(snap[&slave].total_reads, 1);
}

#[tokio::test]
async fn persistence_disabled_drains_queue_without_writing() {
    let (queue, receiver, writer) = PersistenceWriter::start(DatabaseConfig {
        enabled: false,
        ..Default::default()
    })
    .await
    .unwrap();

    queue.enqueue(PersistenceRecord {
        external_code: "S01".to_string(),
        value: 100,
        timestamp: chrono::Utc::now(),
    });
    drop(queue);

    // The writer should exit cleanly once the sender side is dropped and
    // the channel drains, since persistence is disabled.
    tokio::time::timeout(std::time::Duration::from_secs(2), writer.run(receiver))
        .await
        .expect("writer should exit promptly when persistence is disabled");
}

#[test]
fn history_ring_never_exceeds_configured_capacity() {
    let store = StateStore::new(&[1], 3, range());
    for v in 0..10u16 {
        store.update(1, Some(v * 10), None);
    }
    let history = store.history(1, None).unwrap();
    assert_eq!(history.len(), 3);
    // Monotonic in timestamp (I4): each sample's timestamp is >= the last.
    for pair in history.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }
}
