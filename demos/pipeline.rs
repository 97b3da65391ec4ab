use ez_filters::core::props::{PROP_PID_SAMPLE_RATE, PROP_PID_TIMESCALE};
use ez_filters::{
    Error, Filter, FilterArgs, FilterImpl, FilterRegister, PidInstance, PropertyType, Result,
    Session,
};
use log::info;
use std::sync::Arc;

const SAMPLES_PER_FRAME: usize = 1024;

/// Emits frames of 16-bit silence.
#[derive(Default)]
struct Tone {
    frames: u64,
    sent: u64,
}

impl FilterImpl for Tone {
    fn construct(&mut self, filter: &Arc<Filter>) -> Result<()> {
        let pid = filter.new_output_pid()?;
        pid.set_name("audio");
        pid.set_property(PROP_PID_TIMESCALE, 48_000u32)?;
        pid.set_property(PROP_PID_SAMPLE_RATE, 48_000u32)?;
        pid.set_property_str("codec", "pcm_s16le")?;
        Ok(())
    }

    fn update_args(&mut self, _filter: &Arc<Filter>, args: &FilterArgs) -> Result<()> {
        self.frames = args
            .get_value("frames", PropertyType::LUInt, None)
            .and_then(|v| v.as_luint())
            .unwrap_or(50);
        Ok(())
    }

    fn process(&mut self, filter: &Arc<Filter>) -> Result<()> {
        let pid = filter
            .output_pid(0)
            .ok_or_else(|| Error::BadParam("no output pid".into()))?;
        if self.sent == self.frames {
            pid.set_eos()?;
            return Err(Error::EndOfStream);
        }
        let mut pck = pid.new_packet_alloc(SAMPLES_PER_FRAME * 2)?;
        pck.set_cts(self.sent * SAMPLES_PER_FRAME as u64);
        pck.set_duration(SAMPLES_PER_FRAME as u32);
        pck.set_sap(1);
        pck.send()?;
        self.sent += 1;
        Ok(())
    }
}

/// Forwards the first half of every frame without copying it.
struct Halve;

impl FilterImpl for Halve {
    fn configure_pid(
        &mut self,
        filter: &Arc<Filter>,
        pid: &Arc<PidInstance>,
        is_remove: bool,
    ) -> Result<()> {
        if is_remove {
            return Ok(());
        }
        if pid.get_property_str("codec").is_none() {
            return Err(Error::NotSupported("unknown codec".into()));
        }
        if filter.nb_output_pids() == 0 {
            filter.new_output_pid()?;
        }
        Ok(())
    }

    fn process(&mut self, filter: &Arc<Filter>) -> Result<()> {
        let (Some(input), Some(output)) = (filter.input_pid(0), filter.output_pid(0)) else {
            return Ok(());
        };
        while let Some(pck) = input.get_packet() {
            let mut half = output.new_packet_ref(&pck, Some(0..pck.len() / 2))?;
            half.merge_properties_from(&pck)?;
            half.send()?;
            input.drop_packet();
        }
        if input.is_eos() {
            output.set_eos()?;
            return Err(Error::EndOfStream);
        }
        Ok(())
    }
}

/// Logs what it consumes.
#[derive(Default)]
struct Inspect {
    frames: u64,
    bytes: usize,
}

impl FilterImpl for Inspect {
    fn configure_pid(
        &mut self,
        filter: &Arc<Filter>,
        pid: &Arc<PidInstance>,
        is_remove: bool,
    ) -> Result<()> {
        if !is_remove {
            info!("Filter {} accepting PID {}", filter.name(), pid.name());
        }
        Ok(())
    }

    fn process(&mut self, filter: &Arc<Filter>) -> Result<()> {
        let Some(input) = filter.input_pid(0) else {
            return Ok(());
        };
        while let Some(pck) = input.get_packet() {
            self.frames += 1;
            self.bytes += pck.len();
            input.drop_packet();
        }
        if input.is_eos() {
            info!(
                "Filter {} received {} frames, {} bytes, {} us buffered at most",
                filter.name(),
                self.frames,
                self.bytes,
                input.pid().buffer_occupancy().max_duration_us
            );
            return Err(Error::EndOfStream);
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let session = Session::builder()
        .threads(2)
        .register(
            FilterRegister::new("tone", || Box::<Tone>::default())
                .description("silent PCM source")
                .max_input_pids(0),
        )
        .register(FilterRegister::new("halve", || Box::new(Halve)))
        .register(FilterRegister::new("inspect", || Box::<Inspect>::default()))
        .build();

    session.load_filter("tone:FID=src:frames=100")?;
    session.load_filter("halve:FID=half:SID=src")?;
    session.load_filter("inspect:SID=half")?;
    session.run()?;
    session.print_stats();
    Ok(())
}
