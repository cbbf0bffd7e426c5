//! Pushbuffer (DMA command stream) decoder.
//!
//! The guest builds a command stream in VRAM and advances a PUT pointer;
//! the decoder chases it with GET, expanding each header into method
//! dispatches. Control words support unconditional jumps and one level of
//! call/return. Malformed words latch a fault that suspends the channel
//! until it is explicitly reset, so a misbehaving guest cannot make the
//! decoder run off into garbage.

use crate::backend::HostBackend;
use crate::error::KelvinError;
use crate::guest_memory::GuestMemory;
use crate::methods::GraphicsEngine;

/// How far past the current parameter the dispatcher may look. Covers the
/// draw-squash pattern (two header/parameter pairs plus one header).
const MAX_LOOKAHEAD_WORDS: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushbufferFault {
    /// Word matched none of the header or control encodings.
    ReservedCommand { addr: u64, word: u32 },
    /// CALL while a return address is already latched.
    NestedCall { addr: u64 },
    /// RETURN with no call in flight.
    ReturnWithoutCall { addr: u64 },
}

pub struct Pushbuffer {
    get: u64,
    put: u64,
    /// Return address latched by CALL; hardware supports exactly one level.
    return_address: Option<u64>,
    fault: Option<PushbufferFault>,
}

impl Pushbuffer {
    pub fn new(start: u64) -> Self {
        Pushbuffer {
            get: start,
            put: start,
            return_address: None,
            fault: None,
        }
    }

    pub fn get(&self) -> u64 {
        self.get
    }

    pub fn put(&self) -> u64 {
        self.put
    }

    /// Advance the producer pointer. The stream up to `put` must already
    /// be written to VRAM.
    pub fn set_put(&mut self, put: u64) {
        self.put = put;
    }

    pub fn fault(&self) -> Option<PushbufferFault> {
        self.fault
    }

    /// Clear a latched fault and resume fetching at `get`.
    pub fn reset(&mut self, get: u64) {
        self.fault = None;
        self.return_address = None;
        self.get = get;
    }

    fn latch(&mut self, fault: PushbufferFault) -> KelvinError {
        tracing::error!(?fault, "pushbuffer fault");
        self.fault = Some(fault);
        KelvinError::PushbufferError(fault)
    }

    /// Consume the stream until GET catches up with PUT. A latched fault
    /// suspends the channel; further runs fail with the same fault.
    pub fn run(
        &mut self,
        engine: &mut GraphicsEngine,
        vram: &mut dyn GuestMemory,
        backend: &mut dyn HostBackend,
    ) -> Result<(), KelvinError> {
        if let Some(fault) = self.fault {
            return Err(KelvinError::PushbufferError(fault));
        }

        while self.get != self.put {
            let addr = self.get;
            let word = vram.read_words(addr, 1)?[0];
            self.get += 4;

            if word & 0xe000_0003 == 0x2000_0000 {
                // Old-style jump.
                self.get = u64::from(word & 0x1fff_fffc);
            } else if word & 3 == 1 {
                self.get = u64::from(word & !3);
            } else if word & 3 == 2 {
                if self.return_address.is_some() {
                    return Err(self.latch(PushbufferFault::NestedCall { addr }));
                }
                self.return_address = Some(self.get);
                self.get = u64::from(word & !3);
            } else if word == 0x0002_0000 {
                match self.return_address.take() {
                    Some(ret) => self.get = ret,
                    None => {
                        return Err(self.latch(PushbufferFault::ReturnWithoutCall { addr }));
                    }
                }
            } else if word & 0xe003_0003 == 0 || word & 0xe003_0003 == 0x4000_0000 {
                let increasing = word & 0x4000_0000 == 0;
                let mut method = word & 0x1ffc;
                let subchannel = ((word >> 13) & 7) as usize;
                let count = (word >> 18) & 0x7ff;

                for i in 0..count {
                    let parameter = vram.read_words(self.get, 1)?[0];

                    // Lookahead crosses into the next commands, so only the
                    // last parameter of a run gets one.
                    let lookahead = if i + 1 == count && self.put > self.get + 4 {
                        let avail = ((self.put - self.get - 4) / 4) as usize;
                        vram.read_words(self.get + 4, avail.min(MAX_LOOKAHEAD_WORDS))?
                    } else {
                        Vec::new()
                    };

                    let extra =
                        engine.dispatch(subchannel, method, parameter, vram, backend, &lookahead)?;
                    self.get += 4 + 4 * extra as u64;
                    if increasing {
                        method += 4;
                    }
                }
            } else {
                return Err(self.latch(PushbufferFault::ReservedCommand { addr, word }));
            }
        }
        Ok(())
    }
}
