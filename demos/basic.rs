use mapalloc::{Allocator, Config};

fn main() {
    let mut allocator = Allocator::with_config(Config::default().with_min_region_size(4096));

    let a = allocator.allocate(8).unwrap().unwrap();
    let b = allocator.allocate(64).unwrap().unwrap();
    let c = allocator.allocate(16).unwrap().unwrap();
    println!("a: {a:p}, b: {b:p}, c: {c:p}");

    unsafe {
        allocator.free(Some(a));
        allocator.free(Some(b));
    }
    println!("After freeing a and b: {:?}", allocator.stats());

    // `a` and `b` were merged, so this fits where `a` was.
    let d = allocator.allocate(96).unwrap().unwrap();
    println!("d: {d:p} (a was at {a:p})");

    let aligned = allocator.allocate_aligned(100, 256).unwrap().unwrap();
    println!("256 byte aligned block at {aligned:p}");

    let large = allocator.allocate(1 << 20).unwrap();
    println!("With a standalone mapping: {:?}", allocator.stats());

    unsafe {
        allocator.free(large);
        allocator.free(Some(aligned));
        allocator.free(Some(c));
        allocator.free(Some(d));
    }
    println!("Everything freed: {:?}", allocator.stats());
}
