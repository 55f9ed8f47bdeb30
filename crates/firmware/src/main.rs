//! master_of_muppets is [Embassy](https://embassy.dev)-based firmware wiring
//! `master_of_muppets_core`'s deterministic pitch-bend-to-CV pipeline to real
//! hardware: USB-MIDI ingestion, two 8-channel I²C DACs, and the periodic
//! watchdog/force-refresh ticks the core's tests exercise against mocks.
//!
//! Everything interesting — the shared-value fabric, the per-DAC state
//! machine, error classification and recovery, timeout tracking — lives in
//! `master_of_muppets_core` and is unit-tested there on the host. This crate
//! only supplies the concrete [`DacDriver`] and the async task loops that
//! drive a [`Worker`] against it; it is deliberately thin and not
//! exhaustively tested, the same role `crates/firmware` plays for
//! `midival_renaissance_lib` in the project this workspace is descended
//! from.

#![no_std]
#![no_main]

use defmt::{info, unwrap};
use embassy_executor::Spawner;
use embassy_stm32::{
    Config, bind_interrupts,
    gpio::{Level, Output, Speed},
    i2c::{self, I2c},
    mode::Async,
    peripherals,
    time::Hertz,
    usb,
};
use embassy_time::{Duration, Instant, Timer};
use embassy_usb::{Builder, UsbDevice, class::midi::MidiClass, driver::EndpointError};
use master_of_muppets_core::{
    config::{
        CHANNELS_PER_DAC, DAC_COUNT, FORCE_REFRESH_PERIOD_MS, TIMEOUT_THRESHOLD_MS, TOTAL_CHANNELS,
        WATCHDOG_INTERVAL_MS,
    },
    dac_driver::{DacDriver, DacError},
    diagnostic,
    electric_mayhem::Orchestrator,
    error_handler::ErrorKind,
    sample::Sample,
    worker::{Worker, WorkerAction},
};
use static_cell::StaticCell;
use wmidi::MidiMessage;

use {defmt_rtt as _, panic_probe as _};

bind_interrupts!(
    #[doc(hidden)]
    struct Irqs {
        OTG_FS => usb::InterruptHandler<peripherals::USB_OTG_FS>;
        I2C1_EV => i2c::EventInterruptHandler<peripherals::I2C1>;
        I2C1_ER => i2c::ErrorInterruptHandler<peripherals::I2C1>;
        I2C2_EV => i2c::EventInterruptHandler<peripherals::I2C2>;
        I2C2_ER => i2c::ErrorInterruptHandler<peripherals::I2C2>;
    }
);

type UsbDriver = usb::Driver<'static, peripherals::USB_OTG_FS>;
type SharedOrchestrator = Orchestrator<DAC_COUNT, CHANNELS_PER_DAC, TOTAL_CHANNELS>;

static ORCHESTRATOR: StaticCell<SharedOrchestrator> = StaticCell::new();

/// An 8-channel I²C DAC addressed on one bus, with a GPIO latch pin.
///
/// Two DMA channel words are written per `set_*` call (MSB first), followed
/// by pulsing `latch` on `enable` — matching the "hardware latch" model
/// `master_of_muppets_core::dac_driver::DacDriver` assumes.
struct I2cDac<'d> {
    bus: I2c<'d, Async>,
    address: u8,
    latch: Output<'d>,
}

impl<'d> I2cDac<'d> {
    fn new(bus: I2c<'d, Async>, address: u8, latch: Output<'d>) -> Self {
        Self { bus, address, latch }
    }

    fn map_error(err: i2c::Error) -> DacError {
        let kind = match err {
            i2c::Error::Timeout => ErrorKind::Timeout,
            i2c::Error::Nack => ErrorKind::Nak,
            i2c::Error::Arbitration => ErrorKind::ArbitrationLost,
            i2c::Error::Bus | i2c::Error::Crc | i2c::Error::Overrun => ErrorKind::DmaError,
            _ => ErrorKind::Busy,
        };
        DacError::Transport(kind)
    }
}

impl<'d> DacDriver for I2cDac<'d> {
    type Descriptor = ();
    const CHANNELS: usize = CHANNELS_PER_DAC;

    async fn initialise(&mut self, _descriptor: Self::Descriptor) -> Result<(), DacError> {
        self.latch.set_high();
        self.set_all_same(0x8000).await
    }

    async fn enable(&mut self) -> Result<(), DacError> {
        self.latch.set_low();
        Ok(())
    }

    async fn disable(&mut self) -> Result<(), DacError> {
        self.latch.set_high();
        Ok(())
    }

    async fn set_channel(&mut self, idx: usize, sample: Sample) -> Result<(), DacError> {
        if idx >= Self::CHANNELS {
            return Ok(());
        }
        let frame = [idx as u8, (sample >> 8) as u8, sample as u8];
        self.bus
            .write(self.address, &frame)
            .await
            .map_err(Self::map_error)
    }

    async fn set_all_same(&mut self, sample: Sample) -> Result<(), DacError> {
        let values = [sample; CHANNELS_PER_DAC];
        self.set_values(&values).await
    }

    async fn set_values(&mut self, values: &[Sample]) -> Result<(), DacError> {
        let mut frame = [0u8; 1 + CHANNELS_PER_DAC * 2];
        frame[0] = 0xFF; // "write all channels" command byte
        for (i, &sample) in values.iter().take(CHANNELS_PER_DAC).enumerate() {
            frame[1 + i * 2] = (sample >> 8) as u8;
            frame[2 + i * 2] = sample as u8;
        }
        self.bus
            .write(self.address, &frame)
            .await
            .map_err(Self::map_error)
    }
}

fn result_to_kind(result: Result<(), DacError>) -> Result<(), ErrorKind> {
    result.map_err(|err| match err {
        DacError::Transport(kind) => kind,
        DacError::NotInitialized => ErrorKind::NotInitialized,
    })
}

/// Drives one DAC forever: poll the doorbell, react to each
/// [`WorkerAction`], and cede back to the executor between rounds.
async fn run_worker(
    orchestrator: &'static SharedOrchestrator,
    dac_index: usize,
    first_channel: usize,
    mut driver: I2cDac<'static>,
) -> ! {
    let fabric = orchestrator.fabric();
    let muppet = orchestrator
        .muppet(dac_index)
        .expect("dac_index must be within DAC_COUNT");
    let errors = orchestrator.errors();
    let watchdog = orchestrator.watchdog();

    let _ = driver.initialise(()).await;
    let _ = driver.enable().await;

    let mut worker = Worker::<CHANNELS_PER_DAC>::new(dac_index, first_channel);

    loop {
        let mut action = worker.poll(fabric, muppet);
        'transaction: loop {
            action = match action {
                WorkerAction::WaitForDoorbell => break 'transaction,
                WorkerAction::Halted => {
                    info!("DAC {} is fatal; idling", dac_index);
                    Timer::after_secs(5).await;
                    break 'transaction;
                }
                WorkerAction::Transmit { .. } => {
                    watchdog.arm(dac_index, Instant::now());
                    let result = driver.set_values(worker.pending_values()).await;
                    watchdog.disarm(dac_index, Instant::now());
                    worker.on_result(result_to_kind(result), muppet, errors)
                }
                WorkerAction::Backoff(delay) => {
                    Timer::after(delay).await;
                    worker.backoff_elapsed(muppet)
                }
                WorkerAction::ResetPeripheral => {
                    let ok = driver.initialise(()).await.is_ok() && driver.enable().await.is_ok();
                    watchdog.record_recovery(ok);
                    worker.on_reset_result(ok, muppet)
                }
                WorkerAction::Latch => {
                    let _ = driver.enable().await;
                    if worker.latch_done(muppet) {
                        worker.poll(fabric, muppet)
                    } else {
                        break 'transaction;
                    }
                }
            };
        }
        Timer::after_micros(10).await;
    }
}

#[embassy_executor::task]
async fn dac_worker_0(orchestrator: &'static SharedOrchestrator, driver: I2cDac<'static>) -> ! {
    run_worker(orchestrator, 0, 0, driver).await
}

#[embassy_executor::task]
async fn dac_worker_1(orchestrator: &'static SharedOrchestrator, driver: I2cDac<'static>) -> ! {
    run_worker(orchestrator, 1, CHANNELS_PER_DAC, driver).await
}

#[embassy_executor::task]
async fn watchdog_tick(orchestrator: &'static SharedOrchestrator) -> ! {
    loop {
        Timer::after_millis(WATCHDOG_INTERVAL_MS).await;
        let now = Instant::now();
        let threshold = Duration::from_millis(TIMEOUT_THRESHOLD_MS);
        orchestrator.watchdog().tick(now, threshold, |dac| {
            orchestrator.errors().record_error(dac, ErrorKind::Timeout, 0);
        });
    }
}

#[embassy_executor::task]
async fn force_refresh(orchestrator: &'static SharedOrchestrator) -> ! {
    let mut tick: u32 = 0;
    loop {
        Timer::after_millis(FORCE_REFRESH_PERIOD_MS).await;
        orchestrator
            .fabric()
            .write(diagnostic::CHANNEL, diagnostic::diagnostic_waveform(tick));
        orchestrator.request_update();
        tick = tick.wrapping_add(1);
    }
}

#[embassy_executor::task]
async fn usb_task(mut usb: UsbDevice<'static, UsbDriver>) -> ! {
    usb.run().await
}

#[embassy_executor::task]
async fn midi_task(
    mut class: MidiClass<'static, UsbDriver>,
    orchestrator: &'static SharedOrchestrator,
) -> ! {
    loop {
        class.wait_connection().await;
        info!("USB connected");
        let _ = process_midi(&mut class, orchestrator).await;
        info!("USB disconnected");
    }
}

#[doc(hidden)]
struct Disconnected {}

impl From<EndpointError> for Disconnected {
    fn from(val: EndpointError) -> Self {
        match val {
            EndpointError::BufferOverflow => defmt::panic!("Buffer overflow"),
            EndpointError::Disabled => Disconnected {},
        }
    }
}

/// Interprets USB-MIDI event packets (4 bytes: cable/CIN, then up to three
/// MIDI bytes), forwarding pitch-bend messages straight to the orchestrator.
/// Every other message kind is outside this device's scope (spec.md §1
/// non-goals: "no MIDI features beyond pitch-bend-to-CV") and is ignored.
async fn process_midi<'d, T: usb::Instance + 'd>(
    class: &mut MidiClass<'d, usb::Driver<'d, T>>,
    orchestrator: &'static SharedOrchestrator,
) -> Result<(), Disconnected> {
    let mut buf = [0; 64];
    loop {
        let n = class.read_packet(&mut buf).await?;
        for packet in buf[..n].chunks_exact(4) {
            let Ok(message) = MidiMessage::try_from(&packet[1..]) else {
                continue;
            };
            if let MidiMessage::PitchBendChange(channel, bend) = message {
                // wmidi reports the absolute 14-bit value (centre 0x2000);
                // the orchestrator wants the signed deviation from centre.
                let signed = i32::from(u16::from(bend)) - 0x2000;
                orchestrator.on_pitch_bend(channel.number(), signed as i16);
            }
        }
    }
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    info!("Initializing master_of_muppets");

    let mut config = Config::default();
    {
        use embassy_stm32::rcc::*;
        config.rcc.hse = Some(Hse {
            freq: Hertz(8_000_000),
            mode: HseMode::Bypass,
        });
        config.rcc.pll_src = PllSource::HSE;
        config.rcc.pll = Some(Pll {
            prediv: PllPreDiv::DIV4,
            mul: PllMul::MUL216,
            divp: Some(PllPDiv::DIV2),
            divq: Some(PllQDiv::DIV9),
            divr: None,
        });
        config.rcc.ahb_pre = AHBPrescaler::DIV1;
        config.rcc.apb1_pre = APBPrescaler::DIV4;
        config.rcc.apb2_pre = APBPrescaler::DIV2;
        config.rcc.sys = Sysclk::PLL1_P;
        config.rcc.mux.clk48sel = mux::Clk48sel::PLL1_Q;
    }
    let p = embassy_stm32::init(config);

    let orchestrator = ORCHESTRATOR.init(SharedOrchestrator::new());

    let dac0 = I2cDac::new(
        I2c::new(
            p.I2C1,
            p.PB8,
            p.PB9,
            Irqs,
            p.DMA1_CH6,
            p.DMA1_CH0,
            Hertz(400_000),
            Default::default(),
        ),
        0x60,
        Output::new(p.PC0, Level::High, Speed::Low),
    );
    let dac1 = I2cDac::new(
        I2c::new(
            p.I2C2,
            p.PB10,
            p.PB11,
            Irqs,
            p.DMA1_CH7,
            p.DMA1_CH2,
            Hertz(400_000),
            Default::default(),
        ),
        0x61,
        Output::new(p.PC1, Level::High, Speed::Low),
    );

    unwrap!(spawner.spawn(dac_worker_0(orchestrator, dac0)));
    unwrap!(spawner.spawn(dac_worker_1(orchestrator, dac1)));
    unwrap!(spawner.spawn(watchdog_tick(orchestrator)));
    unwrap!(spawner.spawn(force_refresh(orchestrator)));

    static ENDPOINT_OUT_BUFFER: StaticCell<[u8; 256]> = StaticCell::new();
    let mut usb_config = embassy_stm32::usb::Config::default();
    usb_config.vbus_detection = true;
    let driver = usb::Driver::new_fs(
        p.USB_OTG_FS,
        Irqs,
        p.PA12,
        p.PA11,
        ENDPOINT_OUT_BUFFER.init([0; 256]),
        usb_config,
    );

    // per https://pid.codes, FOSS projects can apply to be listed under the vendor ID owned by InterBiometrics
    let vendor_id = 0x1209;
    let product_id = 0x2090;
    let mut config = embassy_usb::Config::new(vendor_id, product_id);
    config.manufacturer = Some("Pawpaw Works");
    config.product = Some("master_of_muppets");
    config.self_powered = true;
    config.max_power = 0;

    static CONFIG_DESCRIPTOR: StaticCell<[u8; 256]> = StaticCell::new();
    static BOS_DESCRIPTOR: StaticCell<[u8; 256]> = StaticCell::new();
    static CONTROL_BUFFER: StaticCell<[u8; 64]> = StaticCell::new();

    let mut builder = Builder::new(
        driver,
        config,
        CONFIG_DESCRIPTOR.init([0; 256]),
        BOS_DESCRIPTOR.init([0; 256]),
        &mut [],
        CONTROL_BUFFER.init([0; 64]),
    );

    let class = MidiClass::new(&mut builder, 0, 1, 64);
    let usb = builder.build();

    unwrap!(spawner.spawn(usb_task(usb)));
    unwrap!(spawner.spawn(midi_task(class, orchestrator)));
}
