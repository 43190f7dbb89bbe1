//! Trap ABI tests: drive the engine purely through register frames and a
//! flat caller memory image, the way the executive does.

use libhsx_mbx::abi::MODULE_ID;
use libhsx_mbx::{Dispatcher, Function, MailboxConfig, MessageFlags, Mode, Status, TrapFrame};

const NAME_AT: u32 = 0x000;
const PAYLOAD_AT: u32 = 0x040;
const BUFFER_AT: u32 = 0x100;
const INFO_AT: u32 = 0x200;
const MEMORY_SIZE: usize = 0x400;

struct Task {
    pid: u16,
    mem: Vec<u8>,
}

impl Task {
    fn new(pid: u16) -> Self {
        Self {
            pid,
            mem: vec![0u8; MEMORY_SIZE],
        }
    }

    fn put(&mut self, addr: u32, bytes: &[u8]) {
        let start = addr as usize;
        self.mem[start..start + bytes.len()].copy_from_slice(bytes);
    }

    fn put_name(&mut self, name: &str) {
        self.mem[..0x40].fill(0);
        self.put(NAME_AT, name.as_bytes());
    }

    fn info(&self) -> [u32; 5] {
        let mut out = [0u32; 5];
        for (i, slot) in out.iter_mut().enumerate() {
            let at = INFO_AT as usize + i * 4;
            *slot = u32::from_le_bytes(self.mem[at..at + 4].try_into().unwrap());
        }
        out
    }

    async fn trap(&mut self, mbx: &Dispatcher, function: Function, args: &[u32]) -> TrapFrame {
        let mut frame = TrapFrame::new(function, args);
        mbx.handle_trap(self.pid, &mut frame, &mut self.mem).await;
        frame
    }
}

#[tokio::test]
async fn test_bind_send_recv_through_registers() {
    let mbx = Dispatcher::new(MailboxConfig::default());
    let mut owner = Task::new(1);
    let mut writer = Task::new(2);
    let mut reader = Task::new(3);

    owner.put_name("app:demo");
    let frame = owner
        .trap(&mbx, Function::Bind, &[NAME_AT, 64, Mode::RDWR.bits() as u32])
        .await;
    assert_eq!(frame.status(), Some(Status::Ok));

    writer.put_name("app:demo");
    let frame = writer
        .trap(&mbx, Function::Open, &[NAME_AT, Mode::WRONLY.bits() as u32])
        .await;
    assert_eq!(frame.status(), Some(Status::Ok));
    let w = frame.regs[1];

    writer.put(PAYLOAD_AT, b"0123456789");
    let frame = writer
        .trap(&mbx, Function::Send, &[w, PAYLOAD_AT, 10, 0, 0, 0])
        .await;
    assert_eq!(frame.status(), Some(Status::Ok));
    assert_eq!(frame.regs[1], 10);

    reader.put_name("app:demo");
    let r = reader
        .trap(&mbx, Function::Open, &[NAME_AT, Mode::RDONLY.bits() as u32])
        .await
        .regs[1];

    let frame = reader
        .trap(&mbx, Function::Recv, &[r, BUFFER_AT, 192, 0, INFO_AT])
        .await;
    assert_eq!(frame.status(), Some(Status::Ok));
    assert_eq!(frame.regs[1], 10);
    assert_eq!(frame.regs[2], 0);
    assert_eq!(frame.regs[4], 2);
    assert_eq!(&reader.mem[BUFFER_AT as usize..BUFFER_AT as usize + 10], b"0123456789");
    assert_eq!(reader.info(), [0, 10, 0, 0, 2]);
}

#[tokio::test]
async fn test_recv_failure_fills_info_block() {
    let mbx = Dispatcher::new(MailboxConfig::default());
    let mut task = Task::new(4);
    task.put_name("app:empty");
    let h = task
        .trap(&mbx, Function::Bind, &[NAME_AT, 64, Mode::RDWR.bits() as u32])
        .await
        .regs[1];

    task.put(INFO_AT, &[0xAA; 20]);
    let frame = task
        .trap(&mbx, Function::Recv, &[h, BUFFER_AT, 64, 0, INFO_AT])
        .await;
    assert_eq!(frame.status(), Some(Status::NoData));
    assert_eq!(task.info(), [Status::NoData.as_raw() as u32, 0, 0, 0, 0]);

    // Buffer outside caller memory: rejected before touching the queue
    task.put(PAYLOAD_AT, b"kept");
    task.trap(&mbx, Function::Send, &[h, PAYLOAD_AT, 4, 0, 0, 0]).await;
    let frame = task
        .trap(&mbx, Function::Recv, &[h, MEMORY_SIZE as u32, 64, 0, INFO_AT])
        .await;
    assert_eq!(frame.status(), Some(Status::NoDescriptor));
    assert_eq!(task.info()[0], Status::NoDescriptor.as_raw() as u32);

    let frame = task.trap(&mbx, Function::Peek, &[h]).await;
    assert_eq!(frame.status(), Some(Status::Ok));
    assert_eq!(frame.regs[1], 1);
    assert_eq!(frame.regs[2], 12);
    assert_eq!(frame.regs[3], 4);
}

#[tokio::test]
async fn test_truncated_recv_reports_overrun() {
    let mbx = Dispatcher::new(MailboxConfig::default());
    let mut task = Task::new(5);
    task.put_name("app:trunc");
    let h = task
        .trap(&mbx, Function::Bind, &[NAME_AT, 64, Mode::RDWR.bits() as u32])
        .await
        .regs[1];

    task.put(PAYLOAD_AT, b"abcdefgh");
    task.trap(&mbx, Function::Send, &[h, PAYLOAD_AT, 8, 0, 0, 0]).await;

    let frame = task.trap(&mbx, Function::Recv, &[h, BUFFER_AT, 3, 0, 0]).await;
    assert_eq!(frame.status(), Some(Status::Ok));
    assert_eq!(frame.regs[1], 3);
    assert_eq!(frame.regs[2], MessageFlags::OVERRUN.bits() as u32);
    assert_eq!(&task.mem[BUFFER_AT as usize..BUFFER_AT as usize + 4], b"abc\0");

    let frame = task.trap(&mbx, Function::Recv, &[h, BUFFER_AT, 64, 0, 0]).await;
    assert_eq!(frame.status(), Some(Status::NoData));
}

#[tokio::test]
async fn test_status_codes_for_bad_requests() {
    let mbx = Dispatcher::new(MailboxConfig::default());
    let mut task = Task::new(6);

    task.put_name("app:missing");
    let frame = task.trap(&mbx, Function::Open, &[NAME_AT, 1]).await;
    assert_eq!(frame.status(), Some(Status::NoDescriptor));

    task.put_name("app:small");
    let frame = task.trap(&mbx, Function::Bind, &[NAME_AT, 0, 3]).await;
    assert_eq!(frame.status(), Some(Status::NoDescriptor));

    let h = task.trap(&mbx, Function::Bind, &[NAME_AT, 16, 3]).await.regs[1];
    let frame = task.trap(&mbx, Function::Send, &[h, PAYLOAD_AT, 9, 0, 0, 0]).await;
    assert_eq!(frame.status(), Some(Status::MsgTooLarge));

    let frame = task.trap(&mbx, Function::Tap, &[h, 1]).await;
    assert_eq!(frame.status(), Some(Status::InvalidHandle));

    assert_eq!(task.trap(&mbx, Function::Close, &[h]).await.status(), Some(Status::Ok));
    assert_eq!(
        task.trap(&mbx, Function::Close, &[h]).await.status(),
        Some(Status::InvalidHandle)
    );

    let mut frame = TrapFrame::new(Function::Close, &[h]);
    frame.module = MODULE_ID + 1;
    assert_eq!(
        mbx.handle_trap(task.pid, &mut frame, &mut task.mem).await,
        Status::InternalError
    );
}

#[tokio::test]
async fn test_oversized_name_rejected() {
    let mbx = Dispatcher::new(MailboxConfig::default());
    let mut task = Task::new(7);
    task.put_name(&format!("app:{}", "n".repeat(40)));
    let frame = task.trap(&mbx, Function::Bind, &[NAME_AT, 64, 3]).await;
    assert_eq!(frame.status(), Some(Status::NoDescriptor));
    assert!(mbx.snapshot().await.is_empty());
}
