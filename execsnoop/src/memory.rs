use std::collections::HashMap;

use execsnoop_common::args::UserMemory;

use crate::task::EFAULT;

const BASE: u64 = 0x7ff0_0000_0000;
const PAGE: u64 = 0x1000;

/// A fake user address space holding argv arrays and the strings they point to.
///
/// Pointers that were never mapped read as `-EFAULT`, the way a bad user pointer does.
#[derive(Debug, Default)]
pub struct SyntheticMemory {
    next: u64,
    arrays: HashMap<u64, Vec<u64>>,
    strings: HashMap<u64, Vec<u8>>,
}

impl SyntheticMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `args` as a NULL-terminated argv array and returns its address.
    pub fn argv<S: AsRef<[u8]>>(&mut self, args: &[S]) -> u64 {
        let args: Vec<Option<&[u8]>> = args.iter().map(|arg| Some(arg.as_ref())).collect();
        self.argv_with(&args)
    }

    /// Like [`argv`](Self::argv), `None` entries become pointers to unmapped memory.
    pub fn argv_with(&mut self, args: &[Option<&[u8]>]) -> u64 {
        let mut pointers = Vec::with_capacity(args.len() + 1);
        for arg in args {
            let addr = self.alloc();
            if let Some(bytes) = arg {
                self.strings.insert(addr, bytes.to_vec());
            }
            pointers.push(addr);
        }
        pointers.push(0);

        let argv = self.alloc();
        self.arrays.insert(argv, pointers);
        argv
    }

    fn alloc(&mut self) -> u64 {
        let addr = BASE + self.next * PAGE;
        self.next += 1;
        addr
    }
}

impl UserMemory for SyntheticMemory {
    fn read_arg_ptr(&self, argv: u64, index: usize) -> Option<u64> {
        self.arrays.get(&argv)?.get(index).copied()
    }

    fn read_str(&self, src: u64, dst: &mut [u8]) -> Result<usize, i64> {
        let string = self.strings.get(&src).ok_or(EFAULT)?;
        if dst.is_empty() {
            return Ok(0);
        }
        // stop at an embedded NUL like the kernel does
        let end = string.iter().position(|&b| b == 0).unwrap_or(string.len());
        let len = end.min(dst.len() - 1);
        dst[..len].copy_from_slice(&string[..len]);
        dst[len] = 0;
        Ok(len + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_terminated_strings() {
        let mut mem = SyntheticMemory::new();
        let argv = mem.argv(&["/bin/true"]);
        let ptr = mem.read_arg_ptr(argv, 0).unwrap();
        assert_eq!(mem.read_arg_ptr(argv, 1), Some(0));

        let mut buf = [0xffu8; 16];
        assert_eq!(mem.read_str(ptr, &mut buf), Ok(10));
        assert_eq!(&buf[..10], b"/bin/true\0");
    }

    #[test]
    fn truncates_into_short_buffers() {
        let mut mem = SyntheticMemory::new();
        let argv = mem.argv(&["abcdef"]);
        let ptr = mem.read_arg_ptr(argv, 0).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(mem.read_str(ptr, &mut buf), Ok(4));
        assert_eq!(&buf, b"abc\0");
    }

    #[test]
    fn unmapped_pointers_fault() {
        let mut mem = SyntheticMemory::new();
        let argv = mem.argv_with(&[None]);
        let ptr = mem.read_arg_ptr(argv, 0).unwrap();
        assert_ne!(ptr, 0);
        assert_eq!(mem.read_str(ptr, &mut [0u8; 8]), Err(EFAULT));
        assert_eq!(mem.read_arg_ptr(0xdead, 0), None);
    }
}
