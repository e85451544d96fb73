//! Corpus minimization for imported cases (`-r`).
//!
//! Removes blocks of decreasing power-of-two size from the input as long as
//! the classified-trace checksum stays put, then re-runs the surviving bytes
//! so the coverage map reflects what actually gets persisted.

use std::time::Duration;

use libafl_bolts::Error;

use crate::{
    bitmap::{classify_counts, hash32, new_map},
    config::{HASH_CONST, TRIM_START_STEPS},
    executor::{ExecOutcome, TargetExecutor},
};

/// First power of two greater than or equal to `val`.
pub fn next_p2(val: u32) -> u32 {
    let mut ret = 1;
    while val > ret {
        ret <<= 1;
    }
    ret
}

fn trace_cksum<E: TargetExecutor + ?Sized>(executor: &E, scratch: &mut [u8]) -> u32 {
    scratch.copy_from_slice(executor.trace_bits());
    classify_counts(scratch);
    hash32(scratch, HASH_CONST)
}

/// Shrink `input` in place while its execution checksum stays `orig_cksum`.
///
/// Returns the new length. The caller only reaches for this on small inputs;
/// an `ExecError` mid-pass is surfaced, any other fault just means the
/// candidate is rejected.
pub fn trim_case<E: TargetExecutor + ?Sized>(
    executor: &mut E,
    input: &mut Vec<u8>,
    orig_cksum: u32,
    timeout: Duration,
) -> Result<usize, Error> {
    let orig_len = input.len();
    let mut scratch = new_map();

    loop {
        let mut changed_any = false;
        let mut del_len = next_p2(input.len() as u32 / TRIM_START_STEPS).max(1) as usize;

        loop {
            let mut del_pos = 0;

            while del_pos < input.len() {
                let tail_start = (del_pos + del_len).min(input.len());
                let mut candidate = Vec::with_capacity(input.len());
                candidate.extend_from_slice(&input[..del_pos]);
                candidate.extend_from_slice(&input[tail_start..]);

                executor.write_input(&candidate)?;
                let outcome = executor.run(timeout)?;
                if outcome == ExecOutcome::ExecError {
                    return Err(Error::unknown("Unable to execute target application"));
                }

                if outcome == ExecOutcome::Ok && trace_cksum(executor, &mut scratch) == orig_cksum
                {
                    *input = candidate;
                    changed_any = true;
                } else {
                    del_pos += del_len;
                }
            }

            if del_len > 1 && !input.is_empty() {
                del_len /= 2;
            } else {
                break;
            }
        }

        if input.is_empty() && changed_any {
            log::warn!("Trimmed down to zero bytes - check the command line and mem limit");
        }

        if !changed_any {
            break;
        }
    }

    // Leave the map in the state the surviving bytes produce.
    executor.write_input(input)?;
    let outcome = executor.run(timeout)?;
    if outcome == ExecOutcome::ExecError {
        return Err(Error::unknown("Unable to execute target application"));
    }

    if input.len() < orig_len {
        log::info!(
            "Trimmed {} to {} bytes ({:0.2}% off)",
            orig_len,
            input.len(),
            100.0 - input.len() as f64 * 100.0 / orig_len as f64
        );
    }

    Ok(input.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_power_of_two() {
        assert_eq!(next_p2(1), 1);
        assert_eq!(next_p2(2), 2);
        assert_eq!(next_p2(3), 4);
        assert_eq!(next_p2(1000), 1024);
    }

    /// Driver whose trace depends only on whether the input still contains
    /// the magic byte.
    struct MagicByteExecutor {
        current: Vec<u8>,
        trace: Vec<u8>,
        execs: u64,
    }

    impl MagicByteExecutor {
        fn new() -> Self {
            Self {
                current: Vec::new(),
                trace: new_map(),
                execs: 0,
            }
        }
    }

    impl TargetExecutor for MagicByteExecutor {
        fn write_input(&mut self, input: &[u8]) -> Result<(), Error> {
            self.current = input.to_vec();
            Ok(())
        }

        fn run(&mut self, _timeout: Duration) -> Result<ExecOutcome, Error> {
            self.trace = new_map();
            self.trace[0] = 1;
            if self.current.contains(&0x42) {
                self.trace[100] = 1;
            }
            self.execs += 1;
            Ok(ExecOutcome::Ok)
        }

        fn trace_bits(&self) -> &[u8] {
            &self.trace
        }

        fn executions(&self) -> u64 {
            self.execs
        }
    }

    #[test]
    fn trims_everything_but_the_interesting_byte() {
        let mut executor = MagicByteExecutor::new();
        let mut input = vec![0u8; 64];
        input[40] = 0x42;

        executor.write_input(&input).unwrap();
        executor.run(Duration::from_secs(1)).unwrap();
        let mut scratch = new_map();
        let orig = trace_cksum(&executor, &mut scratch);

        let new_len =
            trim_case(&mut executor, &mut input, orig, Duration::from_secs(1)).unwrap();

        assert_eq!(new_len, 1);
        assert_eq!(input, vec![0x42]);
    }
}
