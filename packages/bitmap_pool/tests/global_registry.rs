//! The process-wide registry can only be installed once per process, so it is tested in a
//! binary of its own.

use bitmap_pool::{Error, FixedSizeRegistry};

#[test]
fn install_once_then_reachable_everywhere() {
    assert!(FixedSizeRegistry::global().is_none());

    let installed = FixedSizeRegistry::builder()
        .pool(24, 128)
        .pool(96, 32)
        .build()
        .unwrap()
        .install()
        .unwrap();

    let global = FixedSizeRegistry::global().unwrap();
    assert!(std::ptr::eq(installed, global));
    assert_eq!(global.len(), 2);

    let handle = std::thread::spawn(|| {
        FixedSizeRegistry::global()
            .unwrap()
            .with_pool(24, 128, |pool| pool.insert([3_u64; 3]))
            .unwrap()
            .unwrap()
    })
    .join()
    .unwrap();

    let stored = global
        .with_pool(24, 128, |pool| {
            // SAFETY: The handle was issued for a [u64; 3] and has not been removed.
            *unsafe { pool.get(&handle) }.unwrap()
        })
        .unwrap();
    assert_eq!(stored, [3, 3, 3]);

    let second = FixedSizeRegistry::builder().pool(8, 8).build().unwrap();
    assert!(matches!(
        second.install(),
        Err(Error::InvalidConfiguration { .. })
    ));

    // The first registry stays installed.
    assert!(FixedSizeRegistry::global().unwrap().contains(96, 32));
}
