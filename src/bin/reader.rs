//! Firmware entry point: brings the board up, starts the RF chip driver
//! and spawns the task set.
//!
//! The controller link layer and its CBOR codec live in a separate crate
//! on real installations; until that crate is wired in, the `stub_link`
//! module below stands in for it with a permanently-down link, so the
//! reader boots, shows the error UI and keeps the watchdog happy.
#![no_std]
#![no_main]

use defmt::{info, unwrap};
use embassy_executor::Spawner;
use embassy_time::Duration;
use reader_kit::hardware::{self, Board, BoardWatchdog, ReaderPcd, ReaderUi, UartTransport};
use reader_kit::heartbeat::Heartbeat;
use reader_kit::mfrc522::Mfrc522Config;
use reader_kit::pcd::SharedPcd;
use reader_kit::tasks::cardid::{self, CardIdControl};
use reader_kit::tasks::comm::{self, CommOutbox};
use reader_kit::tasks::master::{self, BoardInfo, MasterInbox};
use reader_kit::tasks::ui::{self, UiInbox};
use static_cell::StaticCell;
use {defmt_rtt as _, panic_probe as _};

mod stub_link;

use stub_link::{StubCodec, StubLink};

static HEARTBEAT: Heartbeat = Heartbeat::new();
static CARDID: CardIdControl = CardIdControl::new();
static MASTER_INBOX: MasterInbox = MasterInbox::new();
static COMM_OUTBOX: CommOutbox = CommOutbox::new();
static UI_INBOX: UiInbox = UiInbox::new();
static LINK: StubLink = StubLink::new();

static PCD: StaticCell<SharedPcd<ReaderPcd>> = StaticCell::new();

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    let board = Board::default();
    info!("reader boot");

    let pcd = unwrap!(
        hardware::start_reader(spawner, board.pcd, board.rf_irq, Mfrc522Config::default()).await
    );
    let pcd = PCD.init(SharedPcd::new(pcd));

    let mut watchdog = board.watchdog;
    watchdog.start(Duration::from_millis(1_600));

    unwrap!(spawner.spawn(ui_task(board.ui)));
    unwrap!(spawner.spawn(cardid_task(pcd)));
    unwrap!(spawner.spawn(comm_control_task()));
    unwrap!(spawner.spawn(comm_receive_task(board.transport)));
    unwrap!(spawner.spawn(master_task(board.info, watchdog)));
}

#[embassy_executor::task]
async fn master_task(info: BoardInfo, mut watchdog: BoardWatchdog) -> ! {
    master::run(
        info,
        &MASTER_INBOX,
        &COMM_OUTBOX,
        &UI_INBOX,
        &CARDID,
        &HEARTBEAT,
        &mut watchdog,
    )
    .await
}

#[embassy_executor::task]
async fn cardid_task(pcd: &'static SharedPcd<ReaderPcd>) -> ! {
    cardid::run(&CARDID, pcd, &MASTER_INBOX, &HEARTBEAT).await
}

#[embassy_executor::task]
async fn ui_task(mut board: ReaderUi) -> ! {
    ui::run(&UI_INBOX, &mut board, &HEARTBEAT).await
}

#[embassy_executor::task]
async fn comm_control_task() -> ! {
    let mut codec = StubCodec;
    comm::run_control(&LINK, &mut codec, &COMM_OUTBOX, &HEARTBEAT).await
}

#[embassy_executor::task]
async fn comm_receive_task(mut transport: UartTransport) -> ! {
    let mut codec = StubCodec;
    comm::run_receive(&mut transport, &LINK, &mut codec, &MASTER_INBOX, &HEARTBEAT).await
}
