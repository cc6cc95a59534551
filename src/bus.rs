use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::trace;

/// Shared maskable-interrupt request line.
///
/// Peripherals hold a clone and may raise it from any thread at any instant;
/// the CPU samples and clears it between instructions.
#[derive(Clone, Default)]
pub struct IrqLine(Arc<AtomicBool>);

impl IrqLine {
    pub fn new() -> Self {
        IrqLine::default()
    }

    /// Latch a request. Stays pending until the CPU acknowledges, even while
    /// interrupts are disabled.
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn pending(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn acknowledge(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub type InHandler = Box<dyn FnMut() -> u8>;
pub type OutHandler = Box<dyn FnMut(u8)>;

/// Dispatches the 256-port I/O address space to peripheral handlers.
///
/// Handlers run synchronously inside the IN or OUT instruction that addresses
/// them. Reads from unmapped ports float high (0xFF); writes to unmapped
/// ports are discarded.
pub struct Bus {
    inputs: [Option<InHandler>; 256],
    outputs: [Option<OutHandler>; 256],
    irq: IrqLine,
}

impl Bus {
    pub fn new(irq: IrqLine) -> Self {
        Bus {
            inputs: std::array::from_fn(|_| None),
            outputs: std::array::from_fn(|_| None),
            irq,
        }
    }

    pub fn register_in<F>(&mut self, port: u8, handler: F)
    where
        F: FnMut() -> u8 + 'static,
    {
        self.inputs[port as usize] = Some(Box::new(handler));
    }

    pub fn register_out<F>(&mut self, port: u8, handler: F)
    where
        F: FnMut(u8) + 'static,
    {
        self.outputs[port as usize] = Some(Box::new(handler));
    }

    pub fn read(&mut self, port: u8) -> u8 {
        match self.inputs[port as usize] {
            Some(ref mut handler) => handler(),
            None => {
                trace!("IN from unmapped port 0x{port:02X}");
                0xFF
            }
        }
    }

    pub fn write(&mut self, port: u8, val: u8) {
        match self.outputs[port as usize] {
            Some(ref mut handler) => handler(val),
            None => trace!("OUT to unmapped port 0x{port:02X} discarded"),
        }
    }

    /// Latch a maskable interrupt request into the CPU.
    pub fn trigger_interrupt(&self) {
        self.irq.raise();
    }

    pub fn irq_line(&self) -> IrqLine {
        self.irq.clone()
    }
}
