use crate::{ARG_SIZE, ARGS_CAPACITY, ExecEvent, MAX_ARGS};

/// Read access to the traced process's address space.
pub trait UserMemory {
    /// Reads `argv[index]`. `None` when the slot itself is unreadable.
    fn read_arg_ptr(&self, argv: u64, index: usize) -> Option<u64>;

    /// Copies the NUL-terminated string at `src` into `dst`, never writing past it.
    ///
    /// Follows `bpf_probe_read_user_str`: the copy is always NUL-terminated, truncating when
    /// `dst` is too short, and the returned length counts the terminator.
    fn read_str(&self, src: u64, dst: &mut [u8]) -> Result<usize, i64>;
}

/// Appends up to `max_args` strings from the `argv` array to the event trailer.
///
/// The loop is bounded by [`MAX_ARGS`] regardless of `max_args`. Stops at the first null
/// or unreadable pointer, at a failed or empty read, or once the trailer is full. Whatever
/// was captured before the stop is kept.
#[inline(always)]
pub fn read_args<M: UserMemory>(mem: &M, argv: u64, max_args: u32, event: &mut ExecEvent) {
    for i in 0..MAX_ARGS {
        if i >= max_args as usize {
            break;
        }

        let arg = match mem.read_arg_ptr(argv, i) {
            Some(ptr) if ptr != 0 => ptr,
            _ => break,
        };

        let offset = event.header.args_size as usize;
        if offset >= ARGS_CAPACITY {
            break;
        }
        let remaining = ARGS_CAPACITY - offset;
        let read_size = if remaining < ARG_SIZE {
            remaining
        } else {
            ARG_SIZE
        };

        match mem.read_str(arg, &mut event.args[offset..offset + read_size]) {
            Ok(len) if len > 0 && len <= read_size => {
                event.header.args_count += 1;
                event.header.args_size += len as u32;
            }
            _ => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::vec::Vec;

    use super::*;

    const EFAULT: i64 = -14;

    /// Flat fake address space: one argv array plus the strings it points at.
    struct Fake {
        argv: Vec<u64>,
        strings: HashMap<u64, Vec<u8>>,
    }

    impl Fake {
        fn new(args: &[Option<&[u8]>]) -> Self {
            let mut argv = Vec::new();
            let mut strings = HashMap::new();
            for (i, arg) in args.iter().enumerate() {
                let addr = 0x1000 + (i as u64) * 0x1000;
                argv.push(addr);
                if let Some(bytes) = arg {
                    strings.insert(addr, bytes.to_vec());
                }
            }
            argv.push(0);
            Self { argv, strings }
        }
    }

    impl UserMemory for Fake {
        fn read_arg_ptr(&self, _argv: u64, index: usize) -> Option<u64> {
            self.argv.get(index).copied()
        }

        fn read_str(&self, src: u64, dst: &mut [u8]) -> Result<usize, i64> {
            let s = self.strings.get(&src).ok_or(EFAULT)?;
            if dst.is_empty() {
                return Ok(0);
            }
            let n = s.len().min(dst.len() - 1);
            dst[..n].copy_from_slice(&s[..n]);
            dst[n] = 0;
            Ok(n + 1)
        }
    }

    fn capture(args: &[Option<&[u8]>], max_args: u32) -> ExecEvent {
        let mut event = ExecEvent::zeroed();
        read_args(&Fake::new(args), 0x10, max_args, &mut event);
        event
    }

    #[test]
    fn captures_arguments_in_order() {
        let event = capture(&[Some(b"/bin/ls"), Some(b"-l")], 20);
        assert_eq!(event.header.args_count, 2);
        assert_eq!(event.args(), b"/bin/ls\0-l\0");
    }

    #[test]
    fn tunable_limits_the_scan() {
        let event = capture(&[Some(b"a"), Some(b"b"), Some(b"c")], 2);
        assert_eq!(event.header.args_count, 2);
        assert_eq!(event.args(), b"a\0b\0");
    }

    #[test]
    fn tunable_above_static_bound_is_clamped() {
        let args: Vec<Option<&[u8]>> = (0..MAX_ARGS + 5).map(|_| Some(&b"x"[..])).collect();
        let event = capture(&args, u32::MAX);
        assert_eq!(event.header.args_count as usize, MAX_ARGS);
    }

    #[test]
    fn unreadable_first_argument_yields_nothing() {
        let event = capture(&[None, Some(b"-l")], 20);
        assert_eq!(event.header.args_count, 0);
        assert_eq!(event.header.args_size, 0);
    }

    #[test]
    fn unreadable_argument_truncates_scan() {
        let event = capture(&[Some(b"sh"), None, Some(b"-c")], 20);
        assert_eq!(event.header.args_count, 1);
        assert_eq!(event.args(), b"sh\0");
    }

    #[test]
    fn long_argument_is_truncated_to_arg_size() {
        let long = [b'a'; ARG_SIZE * 2];
        let event = capture(&[Some(&long), Some(b"b")], 20);
        assert_eq!(event.header.args_count, 2);
        assert_eq!(event.header.args_size as usize, ARG_SIZE + 2);
        assert_eq!(event.args[ARG_SIZE - 1], 0);
    }

    #[test]
    fn trailer_capacity_is_never_exceeded() {
        let long = [b'z'; ARG_SIZE * 4];
        let args: Vec<Option<&[u8]>> = (0..MAX_ARGS).map(|_| Some(&long[..])).collect();
        let event = capture(&args, MAX_ARGS as u32);
        assert_eq!(event.header.args_size as usize, ARGS_CAPACITY);
        assert_eq!(event.header.args_count as usize, MAX_ARGS);
    }
}
