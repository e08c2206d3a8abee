//! Producer/consumer tests for the process-data bridge.
//!
//! Each test uses its own segment and semaphore names and removes them on
//! exit so tests can run in parallel.

use ecat_common::bus::Direction;
use ecat_common::bus::BusState;
use ecat_common::bus::config::BridgeConfig;
use ecat_common::bus::master::MemoryRequirements;
use ecat_common::pdo::snapshot::{CycleTimes, SlaveDescriptor, VariableDescriptor};
use ecat_shared_memory::{ProcessDataBridge, ShmError, ShmResult, consumer_identity};
use proptest::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

static SEQ: AtomicU32 = AtomicU32::new(0);

/// Unique bridge names, removed when dropped.
struct TestBridge {
    config: BridgeConfig,
}

impl TestBridge {
    fn new(tag: &str) -> Self {
        let n = SEQ.fetch_add(1, Ordering::Relaxed);
        let pid = std::process::id();
        let mut config = BridgeConfig::named(
            &format!("ecat_it_{tag}_{pid}_{n}"),
            &format!("ecat_it_{tag}_{pid}_{n}_sem"),
        );
        config.semaphore_count = 3;
        Self { config }
    }
}

impl Drop for TestBridge {
    fn drop(&mut self) {
        let _ = ProcessDataBridge::remove(&self.config);
    }
}

const IMAGES: MemoryRequirements = MemoryRequirements {
    input: 64,
    output: 64,
};

/// One slave with one input and one output variable of every width.
fn directory() -> Vec<SlaveDescriptor> {
    let mut slave = SlaveDescriptor::new(1, "io");
    let mut offset = 0;
    for size in [1u32, 2, 4, 8] {
        slave
            .push(Direction::Input, VariableDescriptor::new(&format!("in{size}"), offset, size))
            .unwrap();
        slave
            .push(Direction::Output, VariableDescriptor::new(&format!("out{size}"), offset, size))
            .unwrap();
        offset += size;
    }
    vec![slave]
}

#[test]
fn second_attach_keeps_snapshot() -> ShmResult<()> {
    let t = TestBridge::new("attach");
    let producer = ProcessDataBridge::create(&t.config, IMAGES)?;
    producer.snapshot().publish_directory(&directory()).unwrap();
    producer.snapshot().set_current_state(BusState::SafeOp);
    producer.snapshot().record_cycle(
        42,
        CycleTimes {
            min_ns: 900_000,
            max_ns: 1_100_000,
            avg_ns: 1_000_000,
            current_ns: 1_000_000,
        },
        7,
    );
    producer.output().write(&[0xAB], 0, 1);

    let again = ProcessDataBridge::attach(&t.config, IMAGES)?;
    let snap = again.snapshot();
    assert_eq!(snap.current_state(), BusState::SafeOp);
    assert_eq!(snap.slave_count(), 1);
    assert_eq!(snap.cycle_count.load(Ordering::Acquire), 42);
    assert_eq!(snap.cycle_times().max_ns, 1_100_000);
    assert_eq!(again.output().to_vec()[0], 0xAB);
    Ok(())
}

#[test]
fn consumer_open_without_producer_fails() {
    let t = TestBridge::new("noprod");
    assert!(matches!(
        ProcessDataBridge::open(&t.config),
        Err(ShmError::NotFound { .. })
    ));
}

#[test]
fn at_most_one_pending_pulse() -> ShmResult<()> {
    let t = TestBridge::new("pulse");
    let producer = ProcessDataBridge::create(&t.config, IMAGES)?;
    let consumer = ProcessDataBridge::open(&t.config)?;
    let me = consumer_identity();

    // Fresh slots start with one pulse available.
    assert!(consumer.try_wait(me)?);
    assert!(!consumer.try_wait(me)?);

    for _ in 0..25 {
        producer.publish_cycle();
    }
    assert!(consumer.wait_timeout(me, Duration::from_millis(100))?);
    assert!(!consumer.try_wait(me)?);
    Ok(())
}

#[test]
fn wait_wakes_on_publish() -> ShmResult<()> {
    let t = TestBridge::new("wake");
    let producer = ProcessDataBridge::create(&t.config, IMAGES)?;
    let config = t.config.clone();

    let waiter = std::thread::spawn(move || -> ShmResult<u64> {
        let consumer = ProcessDataBridge::open(&config)?;
        let me = consumer_identity();
        consumer.try_wait(me)?;
        consumer.wait(me)?;
        Ok(consumer.snapshot().cycle_count.load(Ordering::Acquire))
    });

    // Publish until the consumer has taken its initial pulse and blocked.
    let mut cycle = 0;
    while !waiter.is_finished() {
        cycle += 1;
        producer.snapshot().record_cycle(cycle, CycleTimes::default(), 0);
        producer.publish_cycle();
        std::thread::sleep(Duration::from_millis(5));
    }
    let seen = waiter.join().unwrap()?;
    assert!(seen >= 1);
    Ok(())
}

#[test]
fn registrations_are_shared_between_processes_views() -> ShmResult<()> {
    let t = TestBridge::new("reg");
    let producer = ProcessDataBridge::create(&t.config, IMAGES)?;
    let consumer = ProcessDataBridge::open(&t.config)?;
    let me = consumer_identity();

    let slot = consumer.register(me)?;
    assert_eq!(producer.register(me)?, slot);
    assert_eq!(producer.consumer_count(), 1);
    assert!(consumer.release(me));
    assert_eq!(producer.consumer_count(), 0);
    Ok(())
}

macro_rules! roundtrip_case {
    ($name:ident, $ty:ty, $var:literal) => {
        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]
            #[test]
            fn $name(value in any::<$ty>()) {
                let t = TestBridge::new(stringify!($name));
                let producer = ProcessDataBridge::create(&t.config, IMAGES).unwrap();
                producer.snapshot().publish_directory(&directory()).unwrap();
                let consumer = ProcessDataBridge::open(&t.config).unwrap();

                consumer.set_value::<$ty>(0, $var, value).unwrap();
                prop_assert_eq!(producer.get_value::<$ty>(0, $var).unwrap(), value);
                prop_assert_eq!(consumer.get_pointer::<$ty>(0, $var).unwrap().get(), value);
            }
        }
    };
}

roundtrip_case!(roundtrip_u8, u8, "out1");
roundtrip_case!(roundtrip_i8, i8, "out1");
roundtrip_case!(roundtrip_u16, u16, "out2");
roundtrip_case!(roundtrip_i16, i16, "out2");
roundtrip_case!(roundtrip_u32, u32, "out4");
roundtrip_case!(roundtrip_i32, i32, "out4");
roundtrip_case!(roundtrip_u64, u64, "out8");
roundtrip_case!(roundtrip_i64, i64, "out8");

#[test]
fn writes_resolve_among_outputs() -> ShmResult<()> {
    let t = TestBridge::new("dup");
    let producer = ProcessDataBridge::create(&t.config, IMAGES)?;
    let mut slave = SlaveDescriptor::new(1, "echo");
    slave
        .push(Direction::Input, VariableDescriptor::new("Value", 0, 2))
        .unwrap();
    slave
        .push(Direction::Output, VariableDescriptor::new("Value", 4, 2))
        .unwrap();
    slave
        .push(Direction::Input, VariableDescriptor::new("Status", 2, 2))
        .unwrap();
    producer.snapshot().publish_directory(&[slave]).unwrap();

    let consumer = ProcessDataBridge::open(&t.config)?;
    consumer.set_value::<u16>(0, "Value", 0x1234)?;
    assert_eq!(producer.output().to_vec()[4..6], [0x34, 0x12]);
    // Reads still see the input of the same name.
    assert_eq!(consumer.get_value::<u16>(0, "Value")?, 0);
    assert!(matches!(
        consumer.set_value::<u16>(0, "Status", 1),
        Err(ShmError::ReadOnlyVariable { .. })
    ));
    Ok(())
}

#[test]
fn consumer_survives_producer_restart_with_smaller_image() -> ShmResult<()> {
    let t = TestBridge::new("restart");
    let large = MemoryRequirements {
        input: 8192,
        output: 8192,
    };
    let producer = ProcessDataBridge::create(&t.config, large)?;
    let mut slave = SlaveDescriptor::new(1, "tail");
    slave
        .push(Direction::Input, VariableDescriptor::new("v", 8000, 4))
        .unwrap();
    producer.snapshot().publish_directory(&[slave]).unwrap();
    producer.input().write(&7u32.to_le_bytes(), 8000, 4);

    let consumer = ProcessDataBridge::open(&t.config)?;
    assert_eq!(consumer.get_value::<u32>(0, "v")?, 7);

    drop(producer);
    let restarted = ProcessDataBridge::create(
        &t.config,
        MemoryRequirements {
            input: 16,
            output: 16,
        },
    )?;
    assert_eq!(restarted.input().len(), 16);

    // The consumer still holds the previous objects and reads them intact.
    assert_eq!(consumer.get_value::<u32>(0, "v")?, 7);

    let reopened = ProcessDataBridge::open(&t.config)?;
    assert_eq!(reopened.input().len(), 16);
    assert!(matches!(
        reopened.get_value::<u32>(0, "v"),
        Err(ShmError::DirectoryNotPublished)
    ));
    Ok(())
}

#[test]
fn attach_recreates_resized_regions() -> ShmResult<()> {
    let t = TestBridge::new("resize");
    let _producer = ProcessDataBridge::create(&t.config, IMAGES)?;
    let consumer = ProcessDataBridge::open(&t.config)?;

    let smaller = MemoryRequirements {
        input: 8,
        output: 64,
    };
    let attached = ProcessDataBridge::attach(&t.config, smaller)?;
    assert_eq!(attached.input().len(), 8);
    assert_eq!(attached.output().len(), 64);
    assert_eq!(consumer.input().len(), 64);
    assert_eq!(consumer.input().to_vec().len(), 64);
    Ok(())
}
