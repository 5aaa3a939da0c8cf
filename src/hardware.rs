//! Board wiring for the reader hardware (an RP2040 carrier).
//!
//! Pin roles: the RF module hangs off SPI0 with its own chip select, reset
//! line and IRQ pin; the two bi-color LEDs and the beeper make up the UI;
//! UART0 goes to the off-board controller; the hardware watchdog guards
//! the whole show.

use embassy_rp::flash::{Blocking as FlashBlocking, Flash};
use embassy_rp::gpio::{Input, Level, Output, Pull};
use embassy_rp::peripherals::{FLASH, SPI0, UART0};
use embassy_rp::pwm::{Config as PwmConfig, Pwm};
use embassy_rp::spi::{Blocking, Config as SpiConfig, Phase, Polarity, Spi};
use embassy_rp::uart::{Async, Config as UartConfig, Uart, UartRx, UartTx};
use embassy_rp::watchdog::Watchdog;
use embassy_rp::{Peri, bind_interrupts, clocks, peripherals, uart};
use embassy_time::{Duration, with_timeout};
use embedded_hal_bus::spi::{ExclusiveDevice, NoDelay};

use embassy_executor::Spawner;

use crate::Result;
use crate::crpm::SERIAL_LEN;
use crate::heartbeat::FeedWatchdog;
use crate::link::Transport;
use crate::mfrc522::{Connection, IrqChannel, Mfrc522, Mfrc522Config, irq_pump};
use crate::serial_id::serial_number;
use crate::tasks::master::BoardInfo;
use crate::tasks::ui::{Led, UiBoard, UiOutputs};

bind_interrupts!(struct Irqs {
    UART0_IRQ => uart::InterruptHandler<peripherals::UART0>;
});

/// Identity constants reported to the controller.
pub const READER_CLASS: u16 = 0;
pub const HW_MODEL: u16 = 1;
pub const HW_REV: u16 = 1;
pub const SW_VER_MAJOR: u8 = 0;
pub const SW_VER_MINOR: u8 = 2;

const FLASH_SIZE: usize = 2 * 1024 * 1024;

/// The RF module's SPI device: bus plus chip select, one transaction per
/// register access.
pub type RfSpi = ExclusiveDevice<Spi<'static, SPI0, Blocking>, Output<'static>, NoDelay>;

/// The concrete reader driver on this board.
pub type ReaderPcd = Mfrc522<RfSpi, Output<'static>>;

/// The external-interrupt channel the RF IRQ pin is wired to.
pub const RF_IRQ_CHANNEL: IrqChannel = IrqChannel(0);

/// The beeper, on a PWM slice running at 2 MHz so the UI half-period
/// values map straight onto the counter.
pub struct Buzzer {
    pwm: Pwm<'static>,
    cfg: PwmConfig,
}

impl Buzzer {
    fn new(pwm: Pwm<'static>) -> Self {
        Self {
            pwm,
            cfg: PwmConfig::default(),
        }
    }

    /// Drives a square wave with the given half-period in 2 MHz ticks;
    /// 0 silences the beeper.
    pub fn set_half_period(&mut self, ticks: u16) {
        if ticks == 0 {
            self.cfg.enable = false;
        } else {
            let divider = (clocks::clk_sys_freq() / 2_000_000).clamp(1, 255) as u8;
            self.cfg.divider = divider.into();
            self.cfg.phase_correct = false;
            self.cfg.top = ticks.saturating_mul(2).saturating_sub(1);
            self.cfg.compare_a = ticks;
            self.cfg.enable = true;
        }
        self.pwm.set_config(&self.cfg);
    }
}

/// The UI output stage: four LED lines and the beeper.
pub struct ReaderUi {
    status_red: Output<'static>,
    status_green: Output<'static>,
    lock_red: Output<'static>,
    lock_green: Output<'static>,
    buzzer: Buzzer,
}

impl UiBoard for ReaderUi {
    fn apply(&mut self, outputs: &UiOutputs) {
        self.buzzer.set_half_period(outputs.buzzer_half_period);
        self.status_red
            .set_level(Level::from(outputs.leds[Led::StatusRed as usize]));
        self.status_green
            .set_level(Level::from(outputs.leds[Led::StatusGreen as usize]));
        self.lock_red
            .set_level(Level::from(outputs.leds[Led::LockRed as usize]));
        self.lock_green
            .set_level(Level::from(outputs.leds[Led::LockGreen as usize]));
    }
}

/// The controller-facing UART, receive half.
pub struct UartTransport {
    rx: UartRx<'static, UART0, Async>,
}

impl Transport for UartTransport {
    async fn read_byte(&mut self, timeout: Duration) -> Option<u8> {
        let mut byte = [0u8; 1];
        match with_timeout(timeout, self.rx.read(&mut byte)).await {
            Ok(Ok(())) => Some(byte[0]),
            _ => None,
        }
    }
}

/// The hardware watchdog as the master task feeds it.
pub struct BoardWatchdog(Watchdog);

impl BoardWatchdog {
    /// Arms the watchdog; the master must feed it from here on.
    pub fn start(&mut self, window: Duration) {
        self.0.start(window);
    }
}

impl FeedWatchdog for BoardWatchdog {
    fn feed(&mut self) {
        self.0.feed();
    }
}

/// Represents the hardware components of the reader board.
pub struct Board {
    /// The RF chip driver, constructed but not started.
    pub pcd: ReaderPcd,
    /// The RF chip's IRQ line, to be handed to the edge pump.
    pub rf_irq: Input<'static>,
    pub ui: ReaderUi,
    /// Transmit half of the controller UART, owned by the link layer.
    pub uart_tx: UartTx<'static, UART0, Async>,
    pub transport: UartTransport,
    pub watchdog: BoardWatchdog,
    /// Identity constants, serial number included.
    pub info: BoardInfo,
}

impl Default for Board {
    fn default() -> Self {
        let peripherals = embassy_rp::init(embassy_rp::config::Config::default());

        let mut spi_config = SpiConfig::default();
        spi_config.frequency = 1_000_000;
        spi_config.polarity = Polarity::IdleLow;
        spi_config.phase = Phase::CaptureOnFirstTransition;
        let spi = Spi::new_blocking(
            peripherals.SPI0,
            peripherals.PIN_2,
            peripherals.PIN_3,
            peripherals.PIN_4,
            spi_config,
        );
        let rf_cs = Output::new(peripherals.PIN_5, Level::High);
        let rf_spi = ExclusiveDevice::new_no_delay(spi, rf_cs).expect("CS pin is infallible");
        // Held in reset until the driver starts.
        let rf_reset = Output::new(peripherals.PIN_6, Level::Low);
        let rf_irq = Input::new(peripherals.PIN_7, Pull::Down);
        let pcd = Mfrc522::new(Connection::Spi(rf_spi), rf_reset, RF_IRQ_CHANNEL);

        let ui = ReaderUi {
            status_red: Output::new(peripherals.PIN_10, Level::Low),
            status_green: Output::new(peripherals.PIN_11, Level::Low),
            lock_red: Output::new(peripherals.PIN_12, Level::Low),
            lock_green: Output::new(peripherals.PIN_13, Level::Low),
            buzzer: Buzzer::new(Pwm::new_output_a(
                peripherals.PWM_SLICE7,
                peripherals.PIN_14,
                PwmConfig::default(),
            )),
        };

        let uart = Uart::new(
            peripherals.UART0,
            peripherals.PIN_0,
            peripherals.PIN_1,
            Irqs,
            peripherals.DMA_CH0,
            peripherals.DMA_CH1,
            UartConfig::default(),
        );
        let (uart_tx, uart_rx) = uart.split();

        let serial = read_serial(peripherals.FLASH);
        let info = BoardInfo {
            rdr_class: READER_CLASS,
            hw_model: HW_MODEL,
            hw_rev: HW_REV,
            serial,
            sw_ver_major: SW_VER_MAJOR,
            sw_ver_minor: SW_VER_MINOR,
        };

        Self {
            pcd,
            rf_irq,
            ui,
            uart_tx,
            transport: UartTransport { rx: uart_rx },
            watchdog: BoardWatchdog(Watchdog::new(peripherals.WATCHDOG)),
            info,
        }
    }
}

/// Brings the RF side up: spawns the IRQ edge pump, then starts the
/// driver. The pump has to be running before the driver enables chip
/// interrupts, or the first edge would be lost.
pub async fn start_reader(
    spawner: Spawner,
    mut pcd: ReaderPcd,
    rf_irq: Input<'static>,
    config: Mfrc522Config,
) -> Result<ReaderPcd> {
    spawner.spawn(irq_pump(rf_irq, RF_IRQ_CHANNEL))?;
    pcd.start(config).await?;
    Ok(pcd)
}

/// Reads the flash unique id and folds it into the serial-number words.
fn read_serial(flash: Peri<'static, FLASH>) -> [u8; SERIAL_LEN] {
    let mut flash = Flash::<_, FlashBlocking, FLASH_SIZE>::new_blocking(flash);
    let mut id = [0u8; 8];
    let _ = flash.blocking_unique_id(&mut id);
    serial_number([
        u32::from_le_bytes(id[0..4].try_into().expect("4 bytes")),
        u32::from_le_bytes(id[4..8].try_into().expect("4 bytes")),
        0,
    ])
}
