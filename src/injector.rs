//! Placement of the runnable image in the code window.
//!
//! ```text
//! code_addr
//! | stub (trampoline, entry, restart, loop head) | block × U | epilogue | branch |
//!                                    ^------------------------------------------'
//! ```

use crate::arch::{encode_branch, flush_icache, BranchOutOfRange, CodeImage, BRANCH_SIZE};
use crate::arena::ArenaLayout;
use crate::error::{BlockLimits, HarnessError, Result};
use nix::errno::Errno;
use std::fmt;

/// The block under test and how many times it is laid out back to back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestImage {
    block: Vec<u8>,
    unroll_factor: u32,
}

impl TestImage {
    pub fn new(block: &[u8], unroll_factor: u32, limits: &BlockLimits) -> Result<Self> {
        if block.is_empty() {
            return Err(HarnessError::InvalidInput("empty block".into()));
        }
        if unroll_factor == 0 {
            return Err(HarnessError::InvalidInput(
                "unroll factor must be at least 1".into(),
            ));
        }
        limits.check_block_size(block.len())?;
        limits.check_unroll_factor(unroll_factor)?;
        Ok(Self {
            block: block.to_vec(),
            unroll_factor,
        })
    }

    pub fn block(&self) -> &[u8] {
        &self.block
    }

    pub fn unroll_factor(&self) -> u32 {
        self.unroll_factor
    }
}

/// Placement failures. `Copy` so the subject can report them without
/// allocating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementError {
    FootprintOverflow,
    DestinationTooSmall { needed: u64, available: u64 },
    Branch(BranchOutOfRange),
}

impl fmt::Display for PlacementError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlacementError::FootprintOverflow => write!(f, "code footprint overflows"),
            PlacementError::DestinationTooSmall { needed, available } => write!(
                f,
                "code window of {} bytes cannot hold {} bytes",
                available, needed
            ),
            PlacementError::Branch(b) => write!(
                f,
                "branch from {:#x} to {:#x} is out of range",
                b.from, b.to
            ),
        }
    }
}

impl From<PlacementError> for HarnessError {
    fn from(err: PlacementError) -> Self {
        HarnessError::InvalidInput(err.to_string())
    }
}

/// Placement arithmetic for one image in one code window.
#[derive(Debug, Clone, Copy)]
pub struct CodeRegion<'a> {
    image: &'a CodeImage,
    block: &'a [u8],
    unroll_factor: u32,
}

impl<'a> CodeRegion<'a> {
    pub fn new(image: &'a CodeImage, test: &'a TestImage) -> Self {
        Self {
            image,
            block: test.block(),
            unroll_factor: test.unroll_factor(),
        }
    }

    /// Unrounded size of everything written into the window.
    pub fn footprint(&self) -> std::result::Result<u64, PlacementError> {
        (self.block.len() as u64)
            .checked_mul(self.unroll_factor as u64)
            .and_then(|n| n.checked_add(self.image.stub.len() as u64))
            .and_then(|n| n.checked_add(self.image.epilogue.len() as u64))
            .and_then(|n| n.checked_add(BRANCH_SIZE as u64))
            .ok_or(PlacementError::FootprintOverflow)
    }

    /// Offset of the appended branch from the start of the window.
    pub fn branch_offset(&self) -> std::result::Result<u64, PlacementError> {
        Ok(self.footprint()? - BRANCH_SIZE as u64)
    }

    /// Writes the image into `dest`, which will execute at `dest_addr`.
    /// Returns the number of bytes written.
    pub fn render(
        &self,
        dest: &mut [u8],
        dest_addr: u64,
    ) -> std::result::Result<usize, PlacementError> {
        let needed = self.footprint()?;
        if needed > dest.len() as u64 {
            return Err(PlacementError::DestinationTooSmall {
                needed,
                available: dest.len() as u64,
            });
        }

        let mut pos = 0usize;
        let mut put = |bytes: &[u8]| {
            dest[pos..pos + bytes.len()].copy_from_slice(bytes);
            pos += bytes.len();
        };
        put(&self.image.stub);
        for _ in 0..self.unroll_factor {
            put(self.block);
        }
        put(&self.image.epilogue);

        // displacement from where the branch actually lands
        let branch_addr = dest_addr + pos as u64;
        let loop_head = dest_addr + self.image.loop_head_offset as u64;
        let branch = encode_branch(branch_addr, loop_head).map_err(PlacementError::Branch)?;
        dest[pos..pos + BRANCH_SIZE].copy_from_slice(&branch);
        Ok(pos + BRANCH_SIZE)
    }

    /// Maps the code window at its fixed address in the calling process,
    /// renders the image into it and leaves it execute-only.
    ///
    /// Runs in the subject between `fork` and the entry stub: no allocation.
    pub fn inject(&self, layout: &ArenaLayout, arena_fd: libc::c_int) -> std::result::Result<(), InjectError> {
        let len = layout.code_len as usize;
        let addr = unsafe {
            libc::mmap(
                layout.code_addr as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_SHARED | libc::MAP_FIXED_NOREPLACE,
                arena_fd,
                layout.code_offset as libc::off_t,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(InjectError::Map(Errno::last()));
        }
        if addr as u64 != layout.code_addr {
            // pre-4.17 kernels treat NOREPLACE as a hint
            unsafe { libc::munmap(addr, len) };
            return Err(InjectError::Map(Errno::EEXIST));
        }

        // SAFETY: freshly mapped, writable, `len` bytes.
        let window = unsafe { std::slice::from_raw_parts_mut(addr as *mut u8, len) };
        self.render(window, layout.code_addr)
            .map_err(InjectError::Placement)?;

        if unsafe { libc::mprotect(addr, len, libc::PROT_EXEC) } != 0 {
            return Err(InjectError::Protect(Errno::last()));
        }
        flush_icache(addr as *const u8, len);
        Ok(())
    }

    /// Re-renders the image and compares it with the controller's view of
    /// the code window.
    pub fn verify(&self, view: &[u8], code_addr: u64) -> Result<()> {
        let mut expected = vec![0u8; self.footprint()? as usize];
        let written = self.render(&mut expected, code_addr)?;
        if view.len() < written {
            return Err(HarnessError::ProtocolViolation(format!(
                "code view holds {} bytes, image needs {}",
                view.len(),
                written
            )));
        }
        if let Some(offset) = expected
            .iter()
            .zip(view)
            .position(|(want, got)| want != got)
        {
            return Err(HarnessError::ProtocolViolation(format!(
                "injected image differs at code offset {:#x}",
                offset
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectError {
    Map(Errno),
    Placement(PlacementError),
    Protect(Errno),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_image() -> CodeImage {
        CodeImage {
            stub: vec![0xcc; 32],
            entry_offset: 8,
            restart_offset: 16,
            loop_head_offset: 24,
            trampoline_offset: 0,
            epilogue: vec![0xdd; 12],
        }
    }

    #[test]
    fn test_image_validation() {
        let limits = BlockLimits::default();
        assert!(matches!(
            TestImage::new(&[], 10, &limits),
            Err(HarnessError::InvalidInput(_))
        ));
        assert!(matches!(
            TestImage::new(&[0x90], 0, &limits),
            Err(HarnessError::InvalidInput(_))
        ));
        assert!(TestImage::new(&[0x90; 300], 1, &BlockLimits::strict()).is_err());
        let image = TestImage::new(&[0x90], 100, &limits).unwrap();
        assert_eq!(image.block(), &[0x90]);
        assert_eq!(image.unroll_factor(), 100);
    }

    #[test]
    fn test_footprint() {
        let code = fake_image();
        let test = TestImage::new(&[0x48, 0x8b, 0x03], 10, &BlockLimits::default()).unwrap();
        let region = CodeRegion::new(&code, &test);
        assert_eq!(region.footprint().unwrap(), 32 + 30 + 12 + BRANCH_SIZE as u64);
        assert_eq!(region.branch_offset().unwrap(), 32 + 30 + 12);
    }

    #[test]
    fn test_footprint_overflow() {
        let code = fake_image();
        let block = vec![0x90u8; 4096];
        let region = CodeRegion {
            image: &code,
            block: &block,
            unroll_factor: u32::MAX,
        };
        // fits in u64; only the window size check catches it
        assert!(region.footprint().is_ok());
        let mut small = [0u8; 64];
        assert!(matches!(
            region.render(&mut small, 0x1000),
            Err(PlacementError::DestinationTooSmall { .. })
        ));
    }

    #[test]
    fn test_render_layout_and_branch() {
        let code = fake_image();
        let test = TestImage::new(&[0x90, 0x91], 3, &BlockLimits::default()).unwrap();
        let region = CodeRegion::new(&code, &test);
        let mut window = vec![0u8; 4096];
        let base = 0x3_0000_3000u64;
        let n = region.render(&mut window, base).unwrap();
        assert_eq!(n as u64, region.footprint().unwrap());

        assert!(window[..32].iter().all(|&b| b == 0xcc));
        assert_eq!(&window[32..38], &[0x90, 0x91, 0x90, 0x91, 0x90, 0x91]);
        assert!(window[38..50].iter().all(|&b| b == 0xdd));

        let branch_at = region.branch_offset().unwrap();
        let expected = encode_branch(base + branch_at, base + 24).unwrap();
        assert_eq!(&window[50..50 + BRANCH_SIZE], &expected);
        assert!(window[n..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_verify_detects_tampering() {
        let code = fake_image();
        let test = TestImage::new(&[0x90], 5, &BlockLimits::default()).unwrap();
        let region = CodeRegion::new(&code, &test);
        let mut window = vec![0u8; 4096];
        region.render(&mut window, 0x4000).unwrap();
        assert!(region.verify(&window, 0x4000).is_ok());
        assert!(region.verify(&window[..20], 0x4000).is_err());
        window[33] = 0xcc;
        assert!(matches!(
            region.verify(&window, 0x4000),
            Err(HarnessError::ProtocolViolation(_))
        ));
    }
}
