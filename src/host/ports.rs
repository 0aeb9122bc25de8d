use anyhow::{Context, Result};
use jack::{AudioIn, AudioOut, Client, Port, ProcessScope};

/// N-channel JACK port set: `in_1..in_N` and `out_1..out_N`.
pub struct Ports {
    inputs: Vec<Port<AudioIn>>,
    outputs: Vec<Port<AudioOut>>,
}

impl Ports {
    pub fn new(client: &Client, num_channels: usize) -> Result<Self> {
        let mut inputs = Vec::with_capacity(num_channels);
        let mut outputs = Vec::with_capacity(num_channels);

        for ch in 1..=num_channels {
            inputs.push(
                client
                    .register_port(&format!("in_{ch}"), AudioIn::default())
                    .with_context(|| format!("failed to register input port {ch}"))?,
            );
            outputs.push(
                client
                    .register_port(&format!("out_{ch}"), AudioOut::default())
                    .with_context(|| format!("failed to register output port {ch}"))?,
            );
        }

        Ok(Self { inputs, outputs })
    }

    pub fn num_channels(&self) -> usize {
        self.inputs.len()
    }

    pub fn input<'a>(&'a self, ps: &'a ProcessScope, ch: usize) -> &'a [f32] {
        self.inputs[ch].as_slice(ps)
    }

    pub fn output<'a>(&'a mut self, ps: &'a ProcessScope, ch: usize) -> &'a mut [f32] {
        self.outputs[ch].as_mut_slice(ps)
    }

    pub fn silence(&mut self, ps: &ProcessScope) {
        for ch in 0..self.outputs.len() {
            self.outputs[ch].as_mut_slice(ps).fill(0.0);
        }
    }

    /// Port names for auto-connection, as `(ours, theirs, is_input)`.
    pub fn connections(
        &self,
        client_name: &str,
        input_ports: &[String],
        output_ports: &[String],
    ) -> Vec<(String, String, bool)> {
        let mut pairs = Vec::new();
        for (ch, theirs) in input_ports.iter().enumerate().take(self.inputs.len()) {
            pairs.push((format!("{client_name}:in_{}", ch + 1), theirs.clone(), true));
        }
        for (ch, theirs) in output_ports.iter().enumerate().take(self.outputs.len()) {
            pairs.push((
                format!("{client_name}:out_{}", ch + 1),
                theirs.clone(),
                false,
            ));
        }
        pairs
    }
}
