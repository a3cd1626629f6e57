//! Scripted controller stream for unit tests.

use std::io::{self, Cursor, Read, Write};

use crate::codec;
use crate::frame::Header;
use crate::opcode::Opcode;
use crate::protocol::params::{ControlParameters, DataParameters};

/// In-memory stream: reads come from a pre-recorded controller script,
/// writes are captured. Reading past the script behaves like a closed socket.
pub struct MockStream {
    rx: Cursor<Vec<u8>>,
    tx: Vec<u8>,
}

impl MockStream {
    pub fn new(rx: Vec<u8>) -> Self {
        Self { rx: Cursor::new(rx), tx: Vec::new() }
    }

    pub fn written(&self) -> &[u8] {
        &self.tx
    }

    /// Script bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.rx.get_ref().len() - self.rx.position() as usize
    }
}

impl Read for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.rx.read(buf)
    }
}

impl Write for MockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Builder for controller response scripts.
#[derive(Default)]
pub struct Script(Vec<u8>);

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, opcode: Opcode, status: i32) -> Self {
        self.0.extend_from_slice(&Header { opcode, status }.encode());
        self
    }

    pub fn i32(mut self, v: i32) -> Self {
        codec::write_i32(&mut self.0, v);
        self
    }

    pub fn u32(mut self, v: u32) -> Self {
        codec::write_u32(&mut self.0, v);
        self
    }

    pub fn f32(mut self, v: f32) -> Self {
        codec::write_f32(&mut self.0, v);
        self
    }

    pub fn u8(mut self, v: u8) -> Self {
        self.0.push(v);
        self
    }

    /// `GET_PARAMETERS` reply.
    pub fn params(mut self, p: &ControlParameters) -> Self {
        self.0.extend_from_slice(&p.encode());
        self.status(Opcode::GetParameters, 0)
    }

    /// `GET_DATA` reply carrying `main`/`back` samples and no bad windows,
    /// followed by the `GET_PARAMETERS` echo for `beam`.
    pub fn data(mut self, main: &[u32], back: &[u32], beam: i32) -> Self {
        let dprm = DataParameters {
            event_secs: 1_700_000_000,
            event_nsecs: 0,
            samples: main.len() as u32,
            status: 0,
        };
        self.0.extend_from_slice(&dprm.encode());
        codec::write_u32_array(&mut self.0, main);
        codec::write_u32_array(&mut self.0, back);
        self = self.u32(0).i32(0).status(Opcode::GetData, 0);
        self.params(&ControlParameters { beam, ..Default::default() })
    }

    /// One full integration sequence: `SET_PARAMETERS`, `SET_READY_FLAG`
    /// and `GET_DATA` replies.
    pub fn sequence(self, main: &[u32], back: &[u32], beam: i32) -> Self {
        self.status(Opcode::SetParameters, 0)
            .status(Opcode::SetReadyFlag, 0)
            .data(main, back, beam)
    }

    pub fn build(self) -> Vec<u8> {
        self.0
    }

    pub fn stream(self) -> MockStream {
        MockStream::new(self.0)
    }
}
