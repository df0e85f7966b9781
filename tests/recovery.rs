mod common;

mod recovery {
    use crate::common;
    use crate::common::Operation;
    use pretty_assertions::assert_eq;
    use spiftl::error::Error;
    use spiftl::{Ftl, LBA_BYTES};

    #[test]
    fn blank_flash_formats_on_start() {
        let mut flash = common::RamFlash::new(common::SMALL_FLASH);
        let mut ftl = Ftl::new(&mut flash).unwrap();
        ftl.start().unwrap();

        assert!(ftl.check());
        assert_eq!(ftl.lba_count(), 472);
        assert_eq!(ftl.eb_count(), 64);
        let stats = ftl.statistics();
        assert_eq!(stats.valid_lbas, 0);
        assert_eq!(stats.metadata_epoch, 2);
        // two blocks claimed for metadata out of 64
        assert_eq!(stats.empty_ebs, 62);

        let mut out = [0xffu8; LBA_BYTES];
        ftl.read(0, &mut out).unwrap();
        assert_eq!(out, [0u8; LBA_BYTES]);
    }

    #[test]
    fn image_file_survives_between_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flash.bin");

        {
            let mut flash =
                common::RamFlash::new(common::SMALL_FLASH).with_image(path.clone());
            let mut ftl = Ftl::new(&mut flash).unwrap();
            ftl.start().unwrap();
            for lba in 0..32 {
                ftl.write(lba, &common::sector(lba as u64)).unwrap();
            }
            // persist also runs the driver's serialize hook
            ftl.persist().unwrap();
        }

        // brand new RAM contents, state comes purely from the image file
        let mut flash = common::RamFlash::new(common::SMALL_FLASH).with_image(path);
        let mut ftl = Ftl::new(&mut flash).unwrap();
        ftl.start().unwrap();
        assert!(ftl.check());

        let mut out = [0u8; LBA_BYTES];
        for lba in 0..32 {
            ftl.read(lba, &mut out).unwrap();
            assert_eq!(out, common::sector(lba as u64), "lba {lba} from image");
        }
    }

    #[test]
    fn corrupt_newest_generation_falls_back_to_previous() {
        let mut flash = common::RamFlash::new(common::SMALL_FLASH);
        {
            let mut ftl = Ftl::new(&mut flash).unwrap();
            ftl.start().unwrap();
            for lba in 0..50 {
                ftl.write(lba, &common::sector(lba as u64)).unwrap();
            }
            ftl.persist().unwrap();
            assert_eq!(ftl.statistics().metadata_epoch, 3);
            // a second generation with identical state
            ftl.persist().unwrap();
            assert_eq!(ftl.statistics().metadata_epoch, 4);
        }

        flash.corrupt_newest_generation();

        let mut ftl = Ftl::new(&mut flash).unwrap();
        ftl.start().unwrap();
        assert!(ftl.check());
        assert_eq!(ftl.statistics().metadata_epoch, 3);

        let mut out = [0u8; LBA_BYTES];
        for lba in 0..50 {
            ftl.read(lba, &mut out).unwrap();
            assert_eq!(out, common::sector(lba as u64), "lba {lba} from fallback");
        }
    }

    #[test]
    fn geometry_mismatch_falls_through_to_format() {
        let mut small = common::RamFlash::new(common::SMALL_FLASH);
        {
            let mut ftl = Ftl::new(&mut small).unwrap();
            ftl.start().unwrap();
            for lba in 0..16 {
                ftl.write(lba, &common::sector(lba as u64)).unwrap();
            }
            ftl.persist().unwrap();
        }

        // same bytes as a prefix of a device twice the size
        let mut big = common::RamFlash::new(2 * common::SMALL_FLASH);
        big.buf[..common::SMALL_FLASH].copy_from_slice(&small.buf);

        {
            let mut ftl = Ftl::new(&mut big).unwrap();
            ftl.start().unwrap();
            assert!(ftl.check());
            assert_eq!(ftl.lba_count(), 984);
            let stats = ftl.statistics();
            assert_eq!(stats.metadata_epoch, 2);
            assert_eq!(stats.valid_lbas, 0);

            let mut out = [0xffu8; LBA_BYTES];
            ftl.read(0, &mut out).unwrap();
            assert_eq!(out, [0u8; LBA_BYTES]);
        }

        // the mismatched generations were wiped by the format
        assert!(big.metadata_blocks().is_empty());
    }

    #[test]
    fn dropped_final_program_leaves_previous_epoch_recoverable() {
        fn setup(ftl: &mut Ftl<&mut common::RamFlash>) {
            ftl.start().unwrap();
            for lba in 0..40 {
                ftl.write(lba, &common::sector(lba as u64)).unwrap();
            }
        }

        // replay the same deterministic sequence twice to learn how many
        // driver operations the second persist issues
        let total_ops = {
            let mut flash = common::RamFlash::new(common::SMALL_FLASH);
            {
                let mut ftl = Ftl::new(&mut flash).unwrap();
                setup(&mut ftl);
                ftl.persist().unwrap();
                ftl.persist().unwrap();
            }
            // the generation is sealed by programming its checksum buffer
            assert!(matches!(
                flash.operations.last().unwrap(),
                Operation::Program { .. }
            ));
            flash.operations.len()
        };

        let mut flash = common::RamFlash::new_with_fault(common::SMALL_FLASH, total_ops - 1);
        {
            let mut ftl = Ftl::new(&mut flash).unwrap();
            setup(&mut ftl);
            ftl.persist().unwrap();
            let epoch = ftl.statistics().metadata_epoch;
            assert_eq!(epoch, 3);

            // the very last program of the next persist is dropped
            assert_eq!(ftl.persist(), Err(Error::Flash));
            // the fault is latched until the instance is rebuilt
            assert!(!ftl.check());
            assert_eq!(ftl.write(0, &common::sector(0)), Err(Error::Flash));
        }

        flash.disable_faults();
        let mut ftl = Ftl::new(&mut flash).unwrap();
        ftl.start().unwrap();
        assert!(ftl.check());
        assert_eq!(ftl.statistics().metadata_epoch, 3);

        let mut out = [0u8; LBA_BYTES];
        for lba in 0..40 {
            ftl.read(lba, &mut out).unwrap();
            assert_eq!(out, common::sector(lba as u64), "lba {lba} after recovery");
        }
    }
}
