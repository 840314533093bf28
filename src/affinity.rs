//! Each thread remembers, per size class, which arena it last used
//! successfully.  Sticking to a favourite arena keeps a thread's
//! allocations physically close together and avoids re-acquiring a
//! different mutex on every call; only a contended lock makes a
//! thread move on to the next arena.
use std::cell::RefCell;

use crate::size_class::{ARENA_NUM, BUCKET_NUM};

thread_local! {
    static FAVORITE_ARENAS: RefCell<[u8; BUCKET_NUM]> = RefCell::new([0; BUCKET_NUM]);
}

/// Returns this thread's current favourite arena for `class`.
pub fn favorite(class: usize) -> u8 {
    FAVORITE_ARENAS.with(|arenas| arenas.borrow()[class])
}

/// Advances this thread's favourite arena for `class` to the next one
/// (wrapping around `ARENA_NUM`), and returns the new favourite.
pub fn advance(class: usize) -> u8 {
    FAVORITE_ARENAS.with(|arenas| {
        let mut arenas = arenas.borrow_mut();
        arenas[class] = (arenas[class] + 1) % ARENA_NUM as u8;
        arenas[class]
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn advance_wraps_around() {
        let class = 5;
        let start = favorite(class);
        assert_eq!(start, 0);

        for i in 1..(ARENA_NUM as u8) {
            assert_eq!(advance(class), i);
        }
        // One more step wraps back to 0.
        assert_eq!(advance(class), 0);
    }

    #[test]
    fn classes_are_independent() {
        advance(1);
        advance(1);
        assert_eq!(favorite(1), 2);
        assert_eq!(favorite(2), 0);
    }
}
