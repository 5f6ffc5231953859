//! Non-uniform to uniform resampling.
//!
//! The spectrometer samples are not evenly spaced in wavenumber. A rescale
//! table gives, for every output index, the input position to draw from as a
//! whole sample index plus a fractional weight towards the next sample.

use super::RescaleTable;
use crate::data::RawBuffer;

/// Linearly interpolate `input` onto the grid described by `whole`/`fractional`.
///
/// The output is cleared first, so anything past an early stop stays zero.
/// Returns the number of samples written; 0 when any argument is missing,
/// which callers treat as "nothing produced this cycle".
pub fn resample(
    input: Option<&[u16]>,
    whole: Option<&[u32]>,
    fractional: Option<&[f32]>,
    output: Option<&mut [f32]>,
    dc_offset: f32,
) -> usize {
    let (Some(input), Some(whole), Some(fractional), Some(output)) =
        (input, whole, fractional, output)
    else {
        return 0;
    };

    output.fill(0.0);
    let len = output.len().min(whole.len()).min(fractional.len());
    let mut written = 0;

    for i in 0..len {
        let w = whole[i] as usize;
        let f = fractional[i];
        let Some(&a) = input.get(w) else {
            break;
        };
        let a = f32::from(a);
        let value = match input.get(w + 1) {
            Some(&b) => a + f * (f32::from(b) - a),
            // Last input sample: usable only without interpolation.
            None if f == 0.0 => a,
            None => break,
        };
        output[i] = value - dc_offset;
        written += 1;
    }
    written
}

/// A rescale table plus DC offset, applied record by record.
#[derive(Debug, Clone)]
pub struct Resampler {
    table: RescaleTable,
    dc_offset: f32,
}

impl Resampler {
    /// Resampler over `table`, subtracting `dc_offset` from every sample.
    #[must_use]
    pub fn new(table: RescaleTable, dc_offset: f32) -> Self {
        Self { table, dc_offset }
    }

    /// Output samples per record.
    #[must_use]
    pub fn output_len(&self) -> usize {
        self.table.len()
    }

    /// Rescale table.
    #[must_use]
    pub fn table(&self) -> &RescaleTable {
        &self.table
    }

    /// Resample one record; returns the samples written (0 if the table does not fit).
    pub fn resample_record(&self, input: &[u16], output: &mut [f32]) -> usize {
        resample(
            Some(input),
            Some(self.table.whole()),
            Some(self.table.fractional()),
            Some(output),
            self.dc_offset,
        )
    }

    /// Resample `line` of `raw` into `output`.
    pub fn resample_line(&self, raw: &RawBuffer, line: usize, output: &mut [f32]) -> usize {
        match raw.record(line) {
            Some(record) => self.resample_record(record, output),
            None => {
                output.fill(0.0);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_table_is_identity() {
        let input: Vec<u16> = (0..64).map(|i| (i * 37 % 1000) as u16).collect();
        let table = RescaleTable::identity(64);
        let mut output = vec![0.0f32; 64];
        let written = resample(
            Some(&input),
            Some(table.whole()),
            Some(table.fractional()),
            Some(&mut output),
            0.0,
        );
        assert_eq!(written, 64);
        for (o, i) in output.iter().zip(&input) {
            assert_eq!(*o, f32::from(*i));
        }
    }

    #[test]
    fn test_interpolates_and_subtracts_dc() {
        let input = [100u16, 200, 300];
        let whole = [0u32, 1];
        let fractional = [0.25f32, 0.5];
        let mut output = [0.0f32; 2];
        let written = resample(
            Some(&input),
            Some(&whole),
            Some(&fractional),
            Some(&mut output),
            50.0,
        );
        assert_eq!(written, 2);
        assert_eq!(output, [75.0, 200.0]);
    }

    #[test]
    fn test_missing_argument_writes_nothing() {
        let input = [1u16, 2, 3];
        let whole = [0u32];
        let fractional = [0.0f32];
        let mut output = [9.0f32; 1];
        assert_eq!(
            resample(None, Some(&whole), Some(&fractional), Some(&mut output), 0.0),
            0
        );
        assert_eq!(
            resample(Some(&input), None, Some(&fractional), Some(&mut output), 0.0),
            0
        );
        assert_eq!(
            resample(Some(&input), Some(&whole), None, Some(&mut output), 0.0),
            0
        );
        assert_eq!(resample(Some(&input), Some(&whole), Some(&fractional), None, 0.0), 0);
        // Untouched when nothing ran.
        assert_eq!(output, [9.0]);
    }

    #[test]
    fn test_stops_early_past_record_end() {
        let input = [10u16, 20, 30, 40];
        let whole = [0u32, 2, 3, 3, 7];
        let fractional = [0.0f32, 0.5, 0.0, 0.5, 0.0];
        let mut output = [1.0f32; 5];
        let written = resample(
            Some(&input),
            Some(&whole),
            Some(&fractional),
            Some(&mut output),
            0.0,
        );
        assert_eq!(written, 3);
        assert_eq!(output, [10.0, 35.0, 40.0, 0.0, 0.0]);
    }

    #[test]
    fn test_resampler_uses_table_length() {
        let resampler = Resampler::new(RescaleTable::from_positions(&[0.5, 1.5]), 0.0);
        let mut output = [0.0f32; 2];
        assert_eq!(resampler.output_len(), 2);
        assert_eq!(resampler.resample_record(&[0, 10, 20], &mut output), 2);
        assert_eq!(output, [5.0, 15.0]);
    }
}
