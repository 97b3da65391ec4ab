//! Filters shared by the integration tests.

#![allow(dead_code)]

use bytes::Bytes;
use ez_filters::{
    Error, Filter, FilterArgs, FilterImpl, FilterRegister, PidInstance, PropertyType, Result,
    Session,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const PROP_PID_WIDTH: u32 = ez_filters::core::props::PROP_PID_WIDTH;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Longest a test session may run before it is stopped and the test fails.
pub const RUN_TIMEOUT: Duration = Duration::from_secs(20);

/// Runs `session` to completion, stopping it and failing the test if it is
/// still running after [`RUN_TIMEOUT`].
pub fn run_bounded(session: &Session) {
    let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
    let timed_out = std::thread::scope(|scope| {
        let watchdog = scope.spawn(move || {
            let expired = done_rx.recv_timeout(RUN_TIMEOUT).is_err();
            if expired {
                session.stop();
            }
            expired
        });
        let result = session.run();
        let _ = done_tx.send(());
        let expired = watchdog.join().unwrap();
        result.unwrap();
        expired
    });
    assert!(!timed_out, "session still running after {RUN_TIMEOUT:?}");
}

/// One packet seen by a sink.
#[derive(Debug, Clone)]
pub struct Received {
    pub sink: String,
    pub data: Vec<u8>,
    pub dts: Option<u64>,
    pub props_changed: bool,
    pub width: Option<u32>,
}

pub type ReceiveLog = Arc<Mutex<Vec<Received>>>;

pub fn received_by(log: &ReceiveLog, sink: &str) -> Vec<Received> {
    log.lock()
        .unwrap()
        .iter()
        .filter(|r| r.sink == sink)
        .cloned()
        .collect()
}

/// Source emitting `count` two-byte packets `[tag, index]`, then end of stream.
///
/// Flags: `shared` wraps caller memory instead of allocating, `split` sends
/// every packet as two fragments, `endless` never ends, `width` changes the
/// width pid property every 5 packets.
#[derive(Default)]
pub struct Counter {
    count: u64,
    sent: u64,
    tag: u8,
    shared: bool,
    split: bool,
    endless: bool,
    width: bool,
    released: Arc<AtomicUsize>,
}

impl Counter {
    fn send_shared(&self, filter: &Arc<Filter>, payload: Vec<u8>) -> Result<()> {
        let pid = filter
            .output_pid(0)
            .ok_or_else(|| Error::BadParam("no output".into()))?;
        let released = self.released.clone();
        let mut pck = pid.new_packet_shared(
            Bytes::from(payload),
            Some(Box::new(move |_: Bytes| {
                released.fetch_add(1, Ordering::SeqCst);
            })),
        );
        pck.set_dts(self.sent);
        pck.send()
    }

    fn send_fragment(&self, filter: &Arc<Filter>, payload: &[u8], start: bool, end: bool) -> Result<()> {
        let pid = filter
            .output_pid(0)
            .ok_or_else(|| Error::BadParam("no output".into()))?;
        let mut pck = pid.new_packet_alloc(payload.len())?;
        pck.data_mut()?.copy_from_slice(payload);
        pck.set_framing(start, end);
        pck.set_dts(self.sent);
        pck.send()
    }
}

impl FilterImpl for Counter {
    fn construct(&mut self, filter: &Arc<Filter>) -> Result<()> {
        filter.new_output_pid()?;
        Ok(())
    }

    fn update_args(&mut self, _filter: &Arc<Filter>, args: &FilterArgs) -> Result<()> {
        let uint = |key: &str| {
            args.get_value(key, PropertyType::UInt, None)
                .and_then(|v| v.as_uint())
        };
        self.count = uint("count").unwrap_or(0) as u64;
        self.tag = uint("tag").unwrap_or(0) as u8;
        self.shared = args.contains("shared");
        self.split = args.contains("split");
        self.endless = args.contains("endless");
        self.width = args.contains("width");
        Ok(())
    }

    fn process(&mut self, filter: &Arc<Filter>) -> Result<()> {
        let Some(pid) = filter.output_pid(0) else {
            return Err(Error::EndOfStream);
        };
        if !self.endless && self.sent >= self.count {
            pid.set_eos()?;
            return Err(Error::EndOfStream);
        }
        if self.width && self.sent % 5 == 0 {
            pid.set_property(PROP_PID_WIDTH, self.sent as u32)?;
        }
        let payload = vec![self.tag, self.sent as u8];
        if self.shared {
            self.send_shared(filter, payload)?;
        } else if self.split {
            self.send_fragment(filter, &payload[..1], true, false)?;
            self.send_fragment(filter, &payload[1..], false, true)?;
        } else {
            self.send_fragment(filter, &payload, true, true)?;
        }
        self.sent += 1;
        Ok(())
    }
}

/// Sink recording every packet it consumes.
pub struct Dump {
    log: ReceiveLog,
    full_block: bool,
}

impl FilterImpl for Dump {
    fn configure_pid(
        &mut self,
        _filter: &Arc<Filter>,
        pid: &Arc<PidInstance>,
        is_remove: bool,
    ) -> Result<()> {
        if !is_remove {
            pid.set_framing_mode(self.full_block);
        }
        Ok(())
    }

    fn process(&mut self, filter: &Arc<Filter>) -> Result<()> {
        let inputs = filter.input_pids();
        for input in &inputs {
            while let Some(pck) = input.get_packet() {
                let width = input
                    .get_property(PROP_PID_WIDTH)
                    .and_then(|e| e.value().as_uint());
                self.log.lock().unwrap().push(Received {
                    sink: filter.id().unwrap_or_default(),
                    data: pck.data().to_vec(),
                    dts: pck.dts(),
                    props_changed: pck.pid_props_changed(),
                    width,
                });
                input.drop_packet();
            }
        }
        if !inputs.is_empty() && inputs.iter().all(|i| i.is_eos()) {
            return Err(Error::EndOfStream);
        }
        Ok(())
    }
}

/// Sink rejecting every pid.
pub struct Picky;

impl FilterImpl for Picky {
    fn configure_pid(
        &mut self,
        _filter: &Arc<Filter>,
        _pid: &Arc<PidInstance>,
        _is_remove: bool,
    ) -> Result<()> {
        Err(Error::NotSupported("only accepts subtitles".into()))
    }

    fn process(&mut self, _filter: &Arc<Filter>) -> Result<()> {
        Ok(())
    }
}

/// Session with `counter`, `dump`, `blockdump` and `picky` registered.
pub fn session(threads: usize, log: &ReceiveLog, released: &Arc<AtomicUsize>) -> Session {
    init_logger();
    let dump_log = log.clone();
    let block_log = log.clone();
    let released = released.clone();
    Session::builder()
        .threads(threads)
        .register(
            FilterRegister::new("counter", move || {
                Box::new(Counter {
                    released: released.clone(),
                    ..Default::default()
                })
            })
            .description("emits numbered packets")
            .max_input_pids(0),
        )
        .register(FilterRegister::new("dump", move || {
            Box::new(Dump {
                log: dump_log.clone(),
                full_block: false,
            })
        }))
        .register(FilterRegister::new("blockdump", move || {
            Box::new(Dump {
                log: block_log.clone(),
                full_block: true,
            })
        }))
        .register(FilterRegister::new("picky", || Box::new(Picky)))
        .build()
}
