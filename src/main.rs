#![no_std]
#![no_main]

use limine::request::{RequestsEndMarker, RequestsStartMarker};
use limine::BaseRevision;
use x86_64::{structures::paging::PageTableFlags, VirtAddr};

extern crate alloc;
use alloc::boxed::Box;

use cinder::{
    idle_loop, logging,
    memory::{self, frame_allocator, paging},
    processes::process,
    serial, serial_println,
};

#[used]
#[link_section = ".requests"]
static BASE_REVISION: BaseRevision = BaseRevision::new();

#[used]
#[link_section = ".requests_start_marker"]
static _START_MARKER: RequestsStartMarker = RequestsStartMarker::new();

#[used]
#[link_section = ".requests_end_marker"]
static _END_MARKER: RequestsEndMarker = RequestsEndMarker::new();

#[no_mangle]
extern "C" fn kmain() -> ! {
    assert!(BASE_REVISION.is_supported());

    serial::init(0);
    logging::init(0);
    memory::init(0);

    // exercise the translation path with a scratch mapping
    let scratch = VirtAddr::new(0x5000_0000_0000);
    let frame = frame_allocator::alloc_frame().expect("no more frames");
    paging::map_page(scratch, frame.start_address(), PageTableFlags::WRITABLE)
        .expect("map failed");
    match paging::translate(scratch) {
        Some((paddr, _)) => serial_println!("{:?} -> {:?}", scratch, paddr),
        None => serial_println!("translation of {:?} missed", scratch),
    }
    paging::unmap_page(scratch).expect("unmap failed");
    frame_allocator::dealloc_frame(frame);

    // first heap use grows the heap on demand
    let x: Box<i32> = Box::new(10);
    serial_println!(
        "Heap object allocated at: {:p}",
        Box::as_ref(&x) as *const i32
    );

    let image = [0x90u8; 64];
    match process::spawn(&image) {
        Ok(pcb) => serial_println!("spawned process {}", pcb.pid),
        Err(err) => serial_println!("spawn failed: {:?}", err),
    }
    process::print_process_table();

    log::info!(
        "{} frames free after boot",
        frame_allocator::with_frame_allocator(|a| a.free_frames())
    );

    idle_loop();
}

#[panic_handler]
fn rust_panic(info: &core::panic::PanicInfo) -> ! {
    serial_println!("Kernel panic: {}", info);
    idle_loop();
}
