//! Runs ordinary std code on top of [`LockedAllocator`] installed as the
//! global allocator.

use std::{sync::mpsc, thread};

use mapalloc::LockedAllocator;

#[global_allocator]
static ALLOCATOR: LockedAllocator = LockedAllocator::new();

/// Aligned past the 16 bytes every block gets for free.
#[repr(align(128))]
struct CacheLine([u8; 128]);

fn main() {
    // Box example
    let val_box = Box::new(22);
    println!("Box Value: {}, At: {:p}", val_box, val_box);

    // Vec example
    let mut v = Vec::new();
    for i in 0..5 {
        v.push(i * 10);
        println!("Added {}; Capacity: {}; At: {:p}", v[i], v.capacity(), v.as_ptr());
    }

    // String example
    let msg = String::from("Heap Testing");
    println!("\nString '{}' - At: {:p}", msg, msg.as_ptr());

    // Merge example
    let a = Box::new([0u8; 64]);
    let b = Box::new([0u8; 64]);
    let ptr_a = a.as_ptr();

    drop(a);
    drop(b);

    let c = Box::new([0u8; 128]);
    if ptr_a == c.as_ptr() {
        println!("Correctly reused at {:p}", c.as_ptr());
    } else {
        println!("Not reused. A was at {:p} and C is at {:p}", ptr_a, c.as_ptr());
    }

    // Over-aligned example
    let line = Box::new(CacheLine([7; 128]));
    println!("CacheLine at {:p}, aligned: {}", &*line, (&*line as *const CacheLine as usize) % 128 == 0);
    println!("CacheLine first byte: {}", line.0[0]);

    // Channel and thread example. The channel's internals are over-aligned too.
    let (sender, receiver) = mpsc::channel();
    let workers: Vec<_> = (0..4)
        .map(|id| {
            let sender = sender.clone();
            thread::spawn(move || {
                let data: Vec<u64> = (0..1000).map(|n| n * id).collect();
                sender.send(data.iter().sum::<u64>()).unwrap();
            })
        })
        .collect();
    drop(sender);

    for worker in workers {
        worker.join().unwrap();
    }
    println!("Sums from threads: {:?}", receiver.iter().collect::<Vec<_>>());

    // Large example
    let big = vec![1u8; 1 << 20];
    println!("1 MiB buffer at {:p}", big.as_ptr());

    println!("{:?}", ALLOCATOR.stats());
}
