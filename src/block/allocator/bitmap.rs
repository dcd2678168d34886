use crate::{
    addr::MAX_NUM_BLOCKS,
    block::{
        allocator::Allocator,
        header::{BlockFileHeader, FileLock},
    },
    error::{Error, Result},
};

/// Length of the free run at the high end of each nibble value.
const NIBBLE_TYPES: [u8; 16] = [4, 3, 2, 2, 1, 1, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0];

/// Returns how many consecutive blocks can be stored in a nibble of the
/// bitmap, counting free bits from the high end. Only the low 4 bits of
/// `value` are looked at.
pub fn classify_nibble(value: u8) -> u32 {
    u32::from(NIBBLE_TYPES[usize::from(value & 0xf)])
}

fn check_run(size: u32) -> Result<()> {
    if (1..=MAX_NUM_BLOCKS).contains(&size) {
        Ok(())
    } else {
        Err(Error::InvalidArgument("runs must be 1 to 4 blocks long"))
    }
}

/// Reserves `size` blocks inside a free run of exactly `target` blocks and
/// returns the index of the first one.
///
/// The counters are only a hint: if no run of `target` blocks exists after
/// scanning the whole map, they are rebuilt with [`fix_allocation_counters`]
/// and [`Error::CounterDesync`] is returned.
pub fn create_map_block(target: u32, size: u32, header: &mut BlockFileHeader) -> Result<u32> {
    check_run(target)?;
    check_run(size)?;
    if size > target {
        return Err(Error::InvalidArgument("run is smaller than the request"));
    }

    // The map is processed in 32-block words, and each word in 8 nibbles.
    let words = header.map_words();
    let mut current = header.hints[target as usize - 1].get().max(0) as usize;
    if current >= words {
        current = 0;
    }

    for _ in 0..words {
        let mut map_block = header.allocation_map[current].get();
        for j in 0..8 {
            if classify_nibble(map_block as u8) == target {
                let mut header = FileLock::new(header);
                let index_offset = j * 4 + 4 - target;
                let to_add = ((1u32 << size) - 1) << index_offset;
                let word = header.allocation_map[current].get();
                header.allocation_map[current].set(word | to_add);

                header.hints[target as usize - 1].set(current as i32);
                header.add_empty(target, -1);
                if target != size {
                    header.add_empty(target - size, 1);
                }
                header.add_entries(1);

                return Ok(current as u32 * 32 + index_offset);
            }
            map_block >>= 4;
        }

        current += 1;
        if current == words {
            current = 0;
        }
    }

    // Counters can be left behind by an undetected crash.
    log::error!(
        "no free run of {target} blocks in file {}, rebuilding counters",
        header.this_file()
    );
    fix_allocation_counters(header);
    Err(Error::CounterDesync)
}

/// Releases `size` blocks starting at `index`.
///
/// Freed blocks only count as a new run when every block above them in the
/// nibble is free already; otherwise they become reachable once those blocks
/// are released.
pub fn delete_map_block(index: u32, size: u32, header: &mut BlockFileHeader) -> Result<()> {
    check_run(size)?;
    let offset = index % 4;
    if offset + size > 4 {
        return Err(Error::InvalidArgument("run crosses a nibble boundary"));
    }
    if index + size > header.max_entries() {
        return Err(Error::InvalidArgument("run is past the end of the file"));
    }
    if !used_map_block(index, size, header) {
        return Err(Error::NotAllocated { index });
    }

    let word_index = (index / 32) as usize;
    let shift = index % 32 - offset;
    let word = header.allocation_map[word_index].get();
    let nibble = ((word >> shift) & 0xf) as u8;

    // See what type of run will be available after this one is gone.
    let bits_at_end = 4 - size - offset;
    let end_mask = (0x0fu8 << (4 - bits_at_end)) & 0x0f;
    let update_counters = nibble & end_mask == 0;
    let to_clear = ((1u32 << size) - 1) << offset;
    let new_type = classify_nibble(nibble & !(to_clear as u8));

    let mut header = FileLock::new(header);
    header.allocation_map[word_index].set(word & !(to_clear << shift));
    if update_counters {
        if bits_at_end != 0 {
            header.add_empty(bits_at_end, -1);
        }
        header.add_empty(new_type, 1);
    }
    header.add_entries(-1);

    Ok(())
}

/// Rebuilds `empty` and `hints` from a full scan of the bitmap.
pub fn fix_allocation_counters(header: &mut BlockFileHeader) {
    let mut header = FileLock::new(header);
    let mut empty = [0i32; MAX_NUM_BLOCKS as usize];
    for i in 0..header.map_words() {
        let mut map_block = header.allocation_map[i].get();
        for _ in 0..8 {
            let class = classify_nibble(map_block as u8);
            if class != 0 {
                empty[class as usize - 1] += 1;
            }
            map_block >>= 4;
        }
    }

    for (counter, value) in header.empty.iter_mut().zip(empty) {
        counter.set(value);
    }
    for hint in header.hints.iter_mut() {
        hint.set(0);
    }
}

/// Returns true if every block of the run is marked as used.
pub fn used_map_block(index: u32, size: u32, header: &BlockFileHeader) -> bool {
    let start = index as usize;
    let end = start + size as usize;
    if size == 0 || end > header.max_entries() as usize {
        return false;
    }
    header.map_bits()[start..end].all()
}

impl Allocator for BlockFileHeader {
    fn allocate(&mut self, count: u32) -> Result<u32> {
        check_run(count)?;
        let target = (count..=MAX_NUM_BLOCKS)
            .find(|&class| self.empty(class) > 0)
            .ok_or(Error::NoSpace)?;
        create_map_block(target, count, self)
    }

    fn deallocate(&mut self, start: u32, count: u32) -> Result<()> {
        delete_map_block(start, count, self)
    }

    fn available(&self) -> u32 {
        self.empty_blocks()
    }
}

#[cfg(test)]
mod tests {
    use zerocopy::FromZeros;

    use super::*;
    use crate::addr::FileType;

    fn header_for_test(max_entries: u32) -> Box<BlockFileHeader> {
        let mut header = BlockFileHeader::new(FileType::Block256, 0);
        header.max_entries.set(max_entries as i32);
        fix_allocation_counters(&mut header);
        header
    }

    fn empty_counts(header: &BlockFileHeader) -> [i32; 4] {
        [
            header.empty(1),
            header.empty(2),
            header.empty(3),
            header.empty(4),
        ]
    }

    #[test]
    fn classify() {
        assert_eq!(classify_nibble(0b0000), 4);
        assert_eq!(classify_nibble(0b0001), 3);
        assert_eq!(classify_nibble(0b0011), 2);
        assert_eq!(classify_nibble(0b0010), 2);
        assert_eq!(classify_nibble(0b0101), 1);
        assert_eq!(classify_nibble(0b0111), 1);
        assert_eq!(classify_nibble(0b1000), 0);
        assert_eq!(classify_nibble(0b1111), 0);
        // Only the low nibble matters
        assert_eq!(classify_nibble(0xf0), 4);
    }

    #[test]
    fn fresh_counters() {
        let header = header_for_test(64);
        assert_eq!(empty_counts(&header), [0, 0, 0, 16]);
        assert_eq!(header.available(), 64);
    }

    #[test]
    fn create_packs_low_end_of_run() {
        let mut header = header_for_test(32);

        let index = create_map_block(4, 1, &mut header).unwrap();
        assert_eq!(index, 0);
        assert_eq!(header.allocation_map[0].get(), 0b0001);
        assert_eq!(empty_counts(&header), [0, 0, 1, 7]);

        let index = create_map_block(3, 2, &mut header).unwrap();
        assert_eq!(index, 1);
        assert_eq!(header.allocation_map[0].get(), 0b0111);
        assert_eq!(empty_counts(&header), [1, 0, 0, 7]);
        assert_eq!(header.num_entries(), 2);
        assert_eq!(header.updating.get(), 0);
    }

    #[test]
    fn create_uses_hint() {
        let mut header = header_for_test(96);
        header.hints[3].set(2);

        let index = create_map_block(4, 4, &mut header).unwrap();
        assert_eq!(index, 64);
        assert_eq!(header.hints[3].get(), 2);
    }

    #[test]
    fn create_wraps_around() {
        let mut header = header_for_test(64);
        header.allocation_map[1].set(u32::MAX);
        fix_allocation_counters(&mut header);
        header.hints[3].set(1);

        let index = create_map_block(4, 4, &mut header).unwrap();
        assert_eq!(index, 0);
        assert_eq!(header.hints[3].get(), 0);
    }

    #[test]
    fn create_rejects_invalid_sizes() {
        let mut header = header_for_test(32);
        assert!(matches!(
            create_map_block(0, 1, &mut header),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            create_map_block(2, 3, &mut header),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            create_map_block(4, 5, &mut header),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn create_fixes_desync() {
        let mut header = header_for_test(32);
        header.allocation_map[0].set(u32::MAX);
        // The counters still claim eight free runs of four blocks.

        assert!(matches!(
            create_map_block(4, 1, &mut header),
            Err(Error::CounterDesync)
        ));
        assert_eq!(empty_counts(&header), [0, 0, 0, 0]);
        assert_eq!(header.num_entries(), 0);
        assert_eq!(header.updating.get(), 0);
    }

    #[test]
    fn delete_restores_counters() {
        let mut header = header_for_test(32);
        let before = empty_counts(&header);

        for size in 1..=4 {
            let index = header.allocate(size).unwrap();
            header.deallocate(index, size).unwrap();
            assert_eq!(empty_counts(&header), before);
            assert_eq!(header.num_entries(), 0);
        }
    }

    #[test]
    fn delete_below_used_block() {
        let mut header = header_for_test(32);
        let low = header.allocate(2).unwrap();
        let high = header.allocate(2).unwrap();
        assert_eq!((low, high), (0, 2));
        assert_eq!(empty_counts(&header), [0, 0, 0, 7]);

        // The freed blocks are hidden under a used block.
        header.deallocate(low, 2).unwrap();
        assert_eq!(empty_counts(&header), [0, 0, 0, 7]);

        header.deallocate(high, 2).unwrap();
        assert_eq!(empty_counts(&header), [0, 0, 0, 8]);
        assert_eq!(header.allocation_map[0].get(), 0);
    }

    #[test]
    fn delete_not_allocated() {
        let mut header = header_for_test(32);
        assert!(matches!(
            delete_map_block(4, 1, &mut header),
            Err(Error::NotAllocated { index: 4 })
        ));

        let index = header.allocate(1).unwrap();
        header.deallocate(index, 1).unwrap();
        assert!(matches!(
            header.deallocate(index, 1),
            Err(Error::NotAllocated { .. })
        ));
    }

    #[test]
    fn delete_out_of_bounds() {
        let mut header = header_for_test(32);
        assert!(matches!(
            delete_map_block(32, 1, &mut header),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            delete_map_block(2, 3, &mut header),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn allocate_picks_smallest_run() {
        let mut header = header_for_test(32);
        let first = header.allocate(3).unwrap();
        assert_eq!(first, 0);
        assert_eq!(empty_counts(&header), [1, 0, 0, 7]);

        // The single free block left over is preferred to a fresh nibble.
        let second = header.allocate(1).unwrap();
        assert_eq!(second, 3);
        assert_eq!(empty_counts(&header), [0, 0, 0, 7]);
    }

    #[test]
    fn allocate_no_space() {
        let mut header = header_for_test(32);
        for _ in 0..8 {
            header.allocate(4).unwrap();
        }
        assert!(matches!(header.allocate(1), Err(Error::NoSpace)));
        assert_eq!(header.available(), 0);
    }

    #[test]
    fn four_single_blocks() {
        let mut header = BlockFileHeader::new_zeroed();
        header.entry_size.set(256);
        header.max_entries.set(32);
        // Exactly four free single blocks.
        header.allocation_map[0].set(0x7777_ffff);
        fix_allocation_counters(&mut header);
        assert_eq!(empty_counts(&header), [4, 0, 0, 0]);

        let indices: Vec<u32> = (0..4).map(|_| header.allocate(1).unwrap()).collect();
        assert_eq!(indices, [19, 23, 27, 31]);
        assert_eq!(header.empty(1), 0);
        assert_eq!(header.num_entries(), 4);

        header.deallocate(indices[1], 1).unwrap();
        assert_eq!(header.num_entries(), 3);
        assert_eq!(header.empty(1), 1);
    }

    #[test]
    fn used_map_block_checks_range() {
        let mut header = header_for_test(32);
        let index = header.allocate(3).unwrap();
        assert!(used_map_block(index, 3, &header));
        assert!(used_map_block(index + 1, 2, &header));
        assert!(!used_map_block(index, 4, &header));
        assert!(!used_map_block(31, 2, &header));
        assert!(!used_map_block(index, 0, &header));
    }
}
