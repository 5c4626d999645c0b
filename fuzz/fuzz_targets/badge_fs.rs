#![no_main]

use badge_storage::{
    AddressSpace, BadgeFs, FlashAddressSpace, PartitionLayout,
    badge_fs::PartitionId,
    mock_flash::{MockEeprom, MockFlashBase},
};
use libfuzzer_sys::arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;

type Space = FlashAddressSpace<MockEeprom<1024>, MockFlashBase<4, 4, 256>, 1024>;

const EXTERNAL: PartitionId = 0;
const INTERNAL: PartitionId = 1;

const LAYOUTS: [PartitionLayout; 2] = [
    PartitionLayout::new(EXTERNAL, PartitionLayout::size_for(6, 700), 6),
    PartitionLayout::new(INTERNAL, PartitionLayout::size_for(24, 1800), 24),
];
const MAX_ITEMS: [usize; 2] = [6, 24];
const WRITE_AREA: [usize; 2] = [700, 1800];

fuzz_target!(|data: Input| fuzz(data));

#[derive(Arbitrary, Debug, Clone)]
struct Input {
    seed: u64,
    ops: Vec<Op>,
}

#[derive(Arbitrary, Debug, Clone)]
enum Op {
    Store { internal: bool, len: u16 },
    Iterate { internal: bool },
    Find { internal: bool, first_byte: u8 },
    Reboot,
}

fn partition(internal: bool) -> (PartitionId, usize) {
    if internal { (INTERNAL, 1) } else { (EXTERNAL, 0) }
}

fn init(space: Space) -> BadgeFs<Space, 2> {
    // The table of the second partition crosses from the eeprom into the flash
    BadgeFs::init(space, &LAYOUTS, 0).unwrap()
}

fn fuzz(ops: Input) {
    let space = FlashAddressSpace::new(
        MockEeprom::new(),
        MockFlashBase::new(),
        0x0000..0x1000,
    );
    let mut fs = init(space);
    assert_eq!(
        fs.storage()
            .medium_of(fs.mapping(INTERNAL).unwrap().write_area_addr),
        badge_storage::Medium::Internal
    );

    let mut models = [VecDeque::<Vec<u8>>::new(), VecDeque::new()];
    let mut buffer = [0; 2048];
    let mut rng = rand_pcg::Pcg32::seed_from_u64(ops.seed);

    #[cfg(fuzzing_repro)]
    eprintln!("\n=== START ===\n");

    for op in ops.ops.into_iter() {
        #[cfg(fuzzing_repro)]
        for id in [EXTERNAL, INTERNAL] {
            eprintln!("{}", fs.print_items(id).unwrap());
        }
        #[cfg(fuzzing_repro)]
        eprintln!("=== OP: {op:?} ===");

        match op {
            Op::Store { internal, len } => {
                let (id, index) = partition(internal);
                let mut value = vec![0; len as usize % (WRITE_AREA[index] + 50)];
                rng.fill(&mut value[..]);

                let result = fs.store_item(id, &value);
                if value.len() > WRITE_AREA[index] {
                    assert_eq!(result, Err(badge_storage::Error::NoMem));
                    continue;
                }
                result.unwrap();

                let model = &mut models[index];
                model.push_back(value);
                while model.iter().map(Vec::len).sum::<usize>() > WRITE_AREA[index]
                    || model.len() > MAX_ITEMS[index]
                {
                    model.pop_front();
                }

                let status = fs.status(id).unwrap();
                assert_eq!(status.num_stored_items as usize, model.len());
                assert_eq!(
                    status.filled_len as usize,
                    model.iter().map(Vec::len).sum::<usize>()
                );
            }
            Op::Iterate { internal } => {
                let (id, index) = partition(internal);
                let model = &models[index];

                let mut key = match fs.get_first_key(id) {
                    Err(badge_storage::Error::NotFound) => {
                        assert!(model.is_empty());
                        continue;
                    }
                    result => result.unwrap(),
                };

                for (i, expected) in model.iter().enumerate() {
                    let len = fs.get_item(&key, &mut buffer).unwrap();
                    assert_eq!(&buffer[..len as usize], &expected[..]);

                    let result = fs.increment_key(&mut key);
                    if i + 1 == model.len() {
                        assert_eq!(result, Err(badge_storage::Error::NotFound));
                    } else {
                        result.unwrap();
                    }
                }
            }
            Op::Find {
                internal,
                first_byte,
            } => {
                let (id, index) = partition(internal);
                let expected = models[index]
                    .iter()
                    .find(|item| item.first() == Some(&first_byte));

                match fs.find_key(id, &mut buffer, |item| item.first() == Some(&first_byte)) {
                    Ok(key) => {
                        let len = fs.get_item(&key, &mut buffer).unwrap();
                        assert_eq!(Some(&buffer[..len as usize]), expected.map(|v| &v[..]));
                    }
                    Err(badge_storage::Error::NotFound) => assert!(expected.is_none()),
                    Err(e) => panic!("{e:?}"),
                }
            }
            Op::Reboot => {
                let statuses = [EXTERNAL, INTERNAL].map(|id| fs.status(id).unwrap());
                fs = init(fs.free());
                assert_eq!([EXTERNAL, INTERNAL].map(|id| fs.status(id).unwrap()), statuses);
            }
        }
    }
}
