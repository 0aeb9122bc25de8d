use anyhow::{Context, Result};
use assert_no_alloc::assert_no_alloc;
use jack::{AsyncClient, Client, ClientOptions, Control, ProcessScope};
use log::{debug, info, warn};

use crate::host::ports::Ports;
use crate::host::{ConvolutionUnit, EngineParams, UnitController, create_unit};
use crate::settings::AudioSettings;

pub struct NotificationHandler;

impl jack::NotificationHandler for NotificationHandler {
    fn sample_rate(&mut self, _: &Client, sample_rate: jack::Frames) -> Control {
        debug!(">> JACK sample_rate changed to {sample_rate}");
        Control::Continue
    }

    fn xrun(&mut self, _: &Client) -> Control {
        debug!(">> JACK xrun");
        Control::Continue
    }
}

/// JACK process callback driving a [`ConvolutionUnit`].
///
/// JACK periods are usually larger than the engine bin, so the handler
/// slices each period into bin-sized chunks and runs the unit once per
/// chunk. The callback allocates nothing; `assert_no_alloc` enforces that
/// in debug builds.
pub struct ProcessHandler {
    ports: Ports,
    unit: ConvolutionUnit,
}

impl ProcessHandler {
    pub fn new(client: &Client, unit: ConvolutionUnit) -> Result<Self> {
        let ports = Ports::new(client, unit.num_channels())
            .context("failed to create audio ports")?;
        Ok(Self { ports, unit })
    }
}

impl jack::ProcessHandler for ProcessHandler {
    fn process(&mut self, _client: &Client, ps: &ProcessScope) -> Control {
        let total = ps.n_frames() as usize;
        let bin = self.unit.bin_size();
        let channels = self.unit.num_channels();

        assert_no_alloc(|| {
            let mut done = 0;
            while done < total {
                let frames = bin.min(total - done);

                for ch in 0..channels {
                    let input = self.ports.input(ps, ch);
                    self.unit.write_input(ch, &input[done..done + frames]);
                }

                self.unit.process(frames);

                for ch in 0..channels {
                    let out = self.ports.output(ps, ch);
                    out[done..done + frames]
                        .copy_from_slice(&self.unit.output().channel(ch)[..frames]);
                }

                done += frames;
            }
        });

        Control::Continue
    }

    fn buffer_size(&mut self, _client: &Client, frames: jack::Frames) -> Control {
        debug!(">> JACK buffer_size changed to {frames} frames");
        Control::Continue
    }
}

/// A running JACK session around one convolution unit.
pub struct AudioSession {
    active_client: AsyncClient<NotificationHandler, ProcessHandler>,
    sample_rate: usize,
}

impl AudioSession {
    /// Create the client, register ports, install the unit and go live.
    /// Returns the session and the control handle for the engine.
    pub fn start(
        name: &str,
        params: EngineParams,
        audio: &AudioSettings,
    ) -> Result<(Self, UnitController)> {
        let (client, _status) = Client::new(name, ClientOptions::NO_START_SERVER)
            .context("failed to create JACK client")?;

        let sample_rate = client.sample_rate();
        info!(
            "JACK client '{name}': {sample_rate} Hz, {} frame period",
            client.buffer_size()
        );

        let (controller, unit) = create_unit(params);
        let handler =
            ProcessHandler::new(&client, unit).context("failed to create process handler")?;

        let connections = handler.ports.connections(
            name,
            &audio.input_ports,
            &audio.output_ports,
        );

        let active_client = client
            .activate_async(NotificationHandler, handler)
            .context("failed to activate JACK client")?;

        if audio.auto_connect {
            for (ours, theirs, is_input) in connections {
                let (src, dst) = if is_input {
                    (theirs.as_str(), ours.as_str())
                } else {
                    (ours.as_str(), theirs.as_str())
                };
                if let Err(e) = active_client.as_client().connect_ports_by_name(src, dst) {
                    warn!("failed to connect {src} -> {dst}: {e}");
                } else {
                    info!("connected {src} -> {dst}");
                }
            }
        }

        Ok((
            Self {
                active_client,
                sample_rate: sample_rate as usize,
            },
            controller,
        ))
    }

    pub fn sample_rate(&self) -> usize {
        self.sample_rate
    }

    pub fn deactivate(self) -> Result<()> {
        self.active_client
            .deactivate()
            .context("failed to deactivate JACK client")?;
        Ok(())
    }
}
