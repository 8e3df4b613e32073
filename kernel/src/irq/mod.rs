//! IRQ router
//!
//! A fixed table of `(handler, data)` entries indexed by physical IRQ
//! number, a logical-IRQ name table mapping device kinds to per-platform
//! lines, and the timer tick. The controller itself (PIC or GIC) lives
//! under `arch/`; this module owns acknowledge-dispatch-EOI ordering.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::error::{KernelError, KernelResult};
use crate::hal::IrqHandlerFn;
use crate::sync::IrqMutex;

/// Size of the handler table, from the platform controller's line count.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub const MAX_IRQS: usize = 16;
#[cfg(target_arch = "aarch64")]
pub const MAX_IRQS: usize = 256;

/// Platform-independent names for device interrupt kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalIrq {
    Timer,
    Serial0,
    Serial1,
    DiskPrimary,
    DiskSecondary,
    Network,
    Usb,
    Rtc,
    Mouse,
    Keyboard,
}

/// Resolve a logical IRQ to this platform's physical line.
/// `None` means the platform has no such line.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub fn logical_to_physical(kind: LogicalIrq) -> Option<u32> {
    // Classic ISA routing.
    match kind {
        LogicalIrq::Timer => Some(0),
        LogicalIrq::Keyboard => Some(1),
        LogicalIrq::Serial1 => Some(3),
        LogicalIrq::Serial0 => Some(4),
        LogicalIrq::Rtc => Some(8),
        LogicalIrq::Network => Some(10),
        LogicalIrq::Usb => Some(11),
        LogicalIrq::Mouse => Some(12),
        LogicalIrq::DiskPrimary => Some(14),
        LogicalIrq::DiskSecondary => Some(15),
    }
}

#[cfg(target_arch = "aarch64")]
pub fn logical_to_physical(kind: LogicalIrq) -> Option<u32> {
    // QEMU virt: timer on PPI 30, PL011 on SPI 1, PL031 RTC on SPI 2,
    // the first two virtio-mmio transports for disk and network.
    match kind {
        LogicalIrq::Timer => Some(30),
        LogicalIrq::Serial0 => Some(33),
        LogicalIrq::Rtc => Some(34),
        LogicalIrq::DiskPrimary => Some(48),
        LogicalIrq::Network => Some(49),
        LogicalIrq::Serial1
        | LogicalIrq::DiskSecondary
        | LogicalIrq::Usb
        | LogicalIrq::Mouse
        | LogicalIrq::Keyboard => None,
    }
}

/// Whether the platform can deliver this logical IRQ.
pub fn irq_is_available(kind: LogicalIrq) -> bool {
    logical_to_physical(kind).is_some()
}

#[derive(Clone, Copy)]
struct IrqEntry {
    handler: IrqHandlerFn,
    data: *mut (),
}

struct HandlerTable([Option<IrqEntry>; MAX_IRQS]);

// SAFETY: The data pointers are opaque tokens owned by the registrants;
// the table itself is only accessed under the IrqMutex (or from interrupt
// context, where IRQs are already masked).
unsafe impl Send for HandlerTable {}

static HANDLERS: IrqMutex<HandlerTable> = IrqMutex::new(HandlerTable([None; MAX_IRQS]));

static DISPATCH_COUNT: AtomicU64 = AtomicU64::new(0);

// ---------------------------------------------------------------------------
// Controller delegation
// ---------------------------------------------------------------------------

#[cfg(all(target_os = "none", target_arch = "aarch64"))]
fn controller_ack() -> Option<u32> {
    crate::arch::intc::ack()
}

// The PIC identifies the IRQ by vector; the trap path always passes it in.
#[cfg(not(all(target_os = "none", target_arch = "aarch64")))]
fn controller_ack() -> Option<u32> {
    None
}

#[cfg(all(target_os = "none", any(target_arch = "x86", target_arch = "x86_64")))]
fn controller_spurious(irq: u32) -> bool {
    crate::arch::intc::is_spurious(irq)
}

#[cfg(not(all(target_os = "none", any(target_arch = "x86", target_arch = "x86_64"))))]
fn controller_spurious(_irq: u32) -> bool {
    false
}

#[cfg(target_os = "none")]
fn controller_eoi(irq: u32) {
    crate::arch::intc::eoi(irq);
}

#[cfg(target_os = "none")]
fn controller_enable(irq: u32) {
    crate::arch::intc::enable_irq(irq);
}

#[cfg(target_os = "none")]
fn controller_disable(irq: u32) {
    crate::arch::intc::disable_irq(irq);
}

#[cfg(target_os = "none")]
fn controller_set_priority(irq: u32, priority: u8) {
    crate::arch::intc::set_priority(irq, priority);
}

#[cfg(not(target_os = "none"))]
fn controller_eoi(_irq: u32) {}
#[cfg(not(target_os = "none"))]
fn controller_enable(_irq: u32) {}
#[cfg(not(target_os = "none"))]
fn controller_disable(_irq: u32) {}
#[cfg(not(target_os = "none"))]
fn controller_set_priority(_irq: u32, _priority: u8) {}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Record a handler for a physical IRQ and unmask the line. Replaces any
/// previous entry. Per-CPU interrupts (the timer) get a high priority.
pub fn register(irq: u32, handler: IrqHandlerFn, data: *mut ()) -> KernelResult<()> {
    if irq as usize >= MAX_IRQS {
        return Err(KernelError::InvalidArgument { name: "irq" });
    }
    HANDLERS.lock().0[irq as usize] = Some(IrqEntry { handler, data });

    let priority = if is_percpu_irq(irq) { 0x40 } else { 0xA0 };
    controller_set_priority(irq, priority);
    controller_enable(irq);
    Ok(())
}

/// Mask the line and clear its entry.
pub fn unregister(irq: u32) -> KernelResult<()> {
    if irq as usize >= MAX_IRQS {
        return Err(KernelError::InvalidArgument { name: "irq" });
    }
    controller_disable(irq);
    HANDLERS.lock().0[irq as usize] = None;
    Ok(())
}

#[cfg(target_arch = "aarch64")]
fn is_percpu_irq(irq: u32) -> bool {
    // SGIs and PPIs are banked per CPU.
    irq < 32
}

#[cfg(not(target_arch = "aarch64"))]
fn is_percpu_irq(irq: u32) -> bool {
    irq == 0
}

/// Resolve a logical IRQ, register the handler, and enable the line.
pub fn irq_register_logical(
    kind: LogicalIrq,
    handler: IrqHandlerFn,
    data: *mut (),
) -> KernelResult<u32> {
    let irq = logical_to_physical(kind).ok_or(KernelError::NotSupported {
        what: "logical IRQ",
    })?;
    register(irq, handler, data)?;
    Ok(irq)
}

pub fn irq_enable_logical(kind: LogicalIrq) -> KernelResult<()> {
    let irq = logical_to_physical(kind).ok_or(KernelError::NotSupported {
        what: "logical IRQ",
    })?;
    controller_enable(irq);
    Ok(())
}

pub fn irq_disable_logical(kind: LogicalIrq) -> KernelResult<()> {
    let irq = logical_to_physical(kind).ok_or(KernelError::NotSupported {
        what: "logical IRQ",
    })?;
    controller_disable(irq);
    Ok(())
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Acknowledge, dispatch, and complete one interrupt.
///
/// On the x86 family the trap vector already names the line and `pending`
/// is `Some`; on AArch64 the GIC is asked. Runs with interrupts masked
/// (hardware does this on entry); handlers must not call into the VMM or
/// PMM.
pub fn dispatch(pending: Option<u32>) {
    let irq = match pending.or_else(controller_ack) {
        Some(irq) => irq,
        None => {
            log::debug!("irq: spurious interrupt");
            return;
        }
    };
    if controller_spurious(irq) {
        log::debug!("irq: spurious IRQ {}", irq);
        controller_eoi(irq);
        return;
    }

    DISPATCH_COUNT.fetch_add(1, Ordering::Relaxed);

    let entry = if (irq as usize) < MAX_IRQS {
        HANDLERS.lock().0[irq as usize]
    } else {
        None
    };
    match entry {
        Some(e) => (e.handler)(e.data),
        None => log::warn!("irq: unhandled IRQ {}", irq),
    }

    controller_eoi(irq);
}

/// Number of interrupts dispatched since boot.
pub fn dispatch_count() -> u64 {
    DISPATCH_COUNT.load(Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// Timer tick
// ---------------------------------------------------------------------------

static TICKS: AtomicU64 = AtomicU64::new(0);
static FREQUENCY: AtomicUsize = AtomicUsize::new(0);
static TICK_CALLBACK: AtomicUsize = AtomicUsize::new(0);

/// Program the hardware timer at `hz` and route its IRQ here. `callback`
/// is invoked from the tick handler with interrupts masked; it may drive
/// the scheduler but must not block or re-enable interrupts.
pub fn timer_init(hz: u32, callback: Option<fn()>) -> KernelResult<()> {
    if hz == 0 {
        return Err(KernelError::InvalidArgument { name: "hz" });
    }
    FREQUENCY.store(hz as usize, Ordering::Release);
    TICK_CALLBACK.store(callback.map_or(0, |f| f as usize), Ordering::Release);

    #[cfg(target_os = "none")]
    crate::arch::timer::start(hz);
    let irq = logical_to_physical(LogicalIrq::Timer).ok_or(KernelError::NotSupported {
        what: "timer IRQ",
    })?;
    register(irq, timer_irq_handler, core::ptr::null_mut())
}

/// Tick handler: count, re-arm the countdown, then run the callback.
/// Re-arming first means a long callback cannot push the next expiry out.
fn timer_irq_handler(_data: *mut ()) {
    TICKS.fetch_add(1, Ordering::Relaxed);
    #[cfg(target_os = "none")]
    crate::arch::timer::rearm();

    let raw = TICK_CALLBACK.load(Ordering::Acquire);
    if raw != 0 {
        // SAFETY: The value was stored from a valid `fn()` in `timer_init`.
        let callback: fn() = unsafe { core::mem::transmute(raw) };
        callback();
    }
}

/// Monotonic tick count; single writer (the timer IRQ), torn-free 64-bit
/// atomic read everywhere else.
pub fn timer_ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

pub fn timer_frequency() -> u32 {
    FREQUENCY.load(Ordering::Acquire) as u32
}

/// Milliseconds since the timer started, derived from ticks.
pub fn timer_timestamp_ms() -> u64 {
    let hz = timer_frequency() as u64;
    if hz == 0 {
        0
    } else {
        timer_ticks() * 1000 / hz
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicU32;

    fn counting_handler(data: *mut ()) {
        // SAFETY: Tests pass a pointer to a live AtomicU32.
        let counter = unsafe { &*(data as *const AtomicU32) };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn test_register_dispatch_unregister() {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let data = &COUNTER as *const _ as *mut ();

        register(5, counting_handler, data).expect("register in range");
        dispatch(Some(5));
        dispatch(Some(5));
        assert_eq!(COUNTER.load(Ordering::Relaxed), 2);

        unregister(5).expect("unregister");
        dispatch(Some(5));
        assert_eq!(COUNTER.load(Ordering::Relaxed), 2, "cleared entry not invoked");
    }

    #[test]
    fn test_register_replaces_entry() {
        static FIRST: AtomicU32 = AtomicU32::new(0);
        static SECOND: AtomicU32 = AtomicU32::new(0);

        register(6, counting_handler, &FIRST as *const _ as *mut ()).expect("register");
        register(6, counting_handler, &SECOND as *const _ as *mut ()).expect("re-register");
        dispatch(Some(6));
        assert_eq!(FIRST.load(Ordering::Relaxed), 0);
        assert_eq!(SECOND.load(Ordering::Relaxed), 1);
        unregister(6).expect("unregister");
    }

    #[test]
    fn test_out_of_range_irq_rejected() {
        assert!(register(MAX_IRQS as u32, counting_handler, core::ptr::null_mut()).is_err());
        assert!(unregister(MAX_IRQS as u32).is_err());
        // Dispatch of a bogus line logs and drops; it must not panic.
        dispatch(Some(MAX_IRQS as u32 + 3));
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn test_logical_mapping_x86() {
        // Host tests run with the x86 family table.
        assert_eq!(logical_to_physical(LogicalIrq::Timer), Some(0));
        assert_eq!(logical_to_physical(LogicalIrq::Serial0), Some(4));
        assert_eq!(logical_to_physical(LogicalIrq::Rtc), Some(8));
        assert_eq!(logical_to_physical(LogicalIrq::DiskPrimary), Some(14));
        assert!(irq_is_available(LogicalIrq::Keyboard));
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn test_logical_registration() {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let irq = irq_register_logical(
            LogicalIrq::DiskSecondary,
            counting_handler,
            &COUNTER as *const _ as *mut (),
        )
        .expect("disk secondary exists on the x86 family");
        assert_eq!(irq, 15);
        dispatch(Some(15));
        assert_eq!(COUNTER.load(Ordering::Relaxed), 1);
        unregister(irq).expect("unregister");
    }

    #[test]
    fn test_timer_tick_counts_and_calls_back() {
        static FIRED: AtomicU32 = AtomicU32::new(0);
        fn tick_cb() {
            FIRED.fetch_add(1, Ordering::Relaxed);
        }

        timer_init(100, Some(tick_cb)).expect("timer init");
        assert_eq!(timer_frequency(), 100);

        let timer_irq = logical_to_physical(LogicalIrq::Timer).expect("timer line");
        let before = timer_ticks();
        dispatch(Some(timer_irq));
        dispatch(Some(timer_irq));
        assert_eq!(timer_ticks(), before + 2);
        assert_eq!(FIRED.load(Ordering::Relaxed), 2);
        unregister(timer_irq).expect("unregister timer");
    }

    #[test]
    fn test_timer_zero_hz_rejected() {
        assert!(matches!(
            timer_init(0, None),
            Err(KernelError::InvalidArgument { .. })
        ));
    }
}
