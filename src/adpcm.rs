//! IMA4 and Microsoft ADPCM block decoders.

const IMA_STEP_SIZE: [i32; 89] = [
    7, 8, 9, 10, 11, 12, 13, 14, 16, 17, 19, 21, 23, 25, 28, 31, 34, 37, 41, 45, 50, 55, 60, 66,
    73, 80, 88, 97, 107, 118, 130, 143, 157, 173, 190, 209, 230, 253, 279, 307, 337, 371, 408,
    449, 494, 544, 598, 658, 724, 796, 876, 963, 1060, 1166, 1282, 1411, 1552, 1707, 1878, 2066,
    2272, 2499, 2749, 3024, 3327, 3660, 4026, 4428, 4871, 5358, 5894, 6484, 7132, 7845, 8630,
    9493, 10442, 11487, 12635, 13899, 15289, 16818, 18500, 20350, 22358, 24633, 27086, 29794,
    32767,
];

const IMA4_CODEWORD: [i32; 16] = [1, 3, 5, 7, 9, 11, 13, 15, -1, -3, -5, -7, -9, -11, -13, -15];

const IMA4_INDEX_ADJUST: [i32; 16] = [-1, -1, -1, -1, 2, 4, 6, 8, -1, -1, -1, -1, 2, 4, 6, 8];

const MSADPCM_ADAPTION: [i32; 16] = [
    230, 230, 230, 230, 307, 409, 512, 614, 768, 614, 512, 409, 307, 230, 230, 230,
];

const MSADPCM_ADAPTION_COEFF: [[i32; 2]; 7] = [
    [256, 0],
    [512, -256],
    [0, 0],
    [192, 64],
    [240, 0],
    [460, -208],
    [392, -232],
];

pub(crate) const MAX_ADPCM_CHANNELS: usize = 16;

fn read_i16(src: &[u8], at: usize) -> i32 {
    i32::from(i16::from_le_bytes([src[at], src[at + 1]]))
}

/// Decodes one IMA4 block of `align` frames into interleaved 16-bit samples.
///
/// `src` must hold a whole block and `dst` `align * channels` samples.
pub(crate) fn decode_ima4_block(dst: &mut [i16], src: &[u8], channels: usize, align: usize) {
    let mut sample = [0i32; MAX_ADPCM_CHANNELS];
    let mut index = [0i32; MAX_ADPCM_CHANNELS];
    let mut code = [0u32; MAX_ADPCM_CHANNELS];
    let mut pos = 0;
    let mut out = 0;

    for c in 0..channels {
        sample[c] = read_i16(src, pos);
        index[c] = read_i16(src, pos + 2).clamp(0, 88);
        pos += 4;
        dst[out] = sample[c] as i16;
        out += 1;
    }

    for i in 1..align {
        if i & 7 == 1 {
            for word in code.iter_mut().take(channels) {
                *word = u32::from_le_bytes([src[pos], src[pos + 1], src[pos + 2], src[pos + 3]]);
                pos += 4;
            }
        }
        for c in 0..channels {
            let nibble = (code[c] & 0xf) as usize;
            code[c] >>= 4;

            sample[c] += IMA4_CODEWORD[nibble] * IMA_STEP_SIZE[index[c] as usize] / 8;
            sample[c] = sample[c].clamp(-32768, 32767);

            index[c] = (index[c] + IMA4_INDEX_ADJUST[nibble]).clamp(0, 88);

            dst[out] = sample[c] as i16;
            out += 1;
        }
    }
}

/// Decodes one MSADPCM block of `align` frames into interleaved 16-bit samples.
pub(crate) fn decode_msadpcm_block(dst: &mut [i16], src: &[u8], channels: usize, align: usize) {
    let mut predictor = [0usize; MAX_ADPCM_CHANNELS];
    let mut delta = [0i32; MAX_ADPCM_CHANNELS];
    let mut history = [[0i32; 2]; MAX_ADPCM_CHANNELS];
    let mut pos = 0;

    for p in predictor.iter_mut().take(channels) {
        *p = usize::from(src[pos].min(6));
        pos += 1;
    }
    for d in delta.iter_mut().take(channels) {
        *d = read_i16(src, pos);
        pos += 2;
    }
    for h in history.iter_mut().take(channels) {
        h[0] = read_i16(src, pos);
        pos += 2;
    }
    for h in history.iter_mut().take(channels) {
        h[1] = read_i16(src, pos);
        pos += 2;
    }

    // The older sample of the header comes out first.
    let mut out = 0;
    for h in history.iter().take(channels) {
        dst[out] = h[1] as i16;
        out += 1;
    }
    for h in history.iter().take(channels) {
        dst[out] = h[0] as i16;
        out += 1;
    }

    let mut high_nibble = true;
    for _ in 2..align {
        for c in 0..channels {
            let nibble = if high_nibble {
                usize::from(src[pos] >> 4)
            } else {
                let low = usize::from(src[pos] & 0x0f);
                pos += 1;
                low
            };
            high_nibble = !high_nibble;

            let coeff = MSADPCM_ADAPTION_COEFF[predictor[c]];
            let mut pred = (history[c][0] * coeff[0] + history[c][1] * coeff[1]) / 256;
            pred += ((nibble as i32 ^ 0x08) - 0x08) * delta[c];
            let pred = pred.clamp(-32768, 32767);

            history[c][1] = history[c][0];
            history[c][0] = pred;

            delta[c] = (MSADPCM_ADAPTION[nibble] * delta[c] / 256).max(16);

            dst[out] = pred as i16;
            out += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ima4_header_and_silence() {
        // Header sample 1000, index 0, then 64 zero nibbles: each nibble 0
        // adds 1 * 7 / 8 == 0 at index 0, so the output holds at 1000.
        let mut block = vec![0u8; 36];
        block[0..2].copy_from_slice(&1000i16.to_le_bytes());
        let mut out = vec![0i16; 65];
        decode_ima4_block(&mut out, &block, 1, 65);
        assert!(out.iter().all(|&s| s == 1000));
    }

    #[test]
    fn test_ima4_step_up() {
        // Nibble 7 at index 40 (step 337) adds 15 * 337 / 8 = 631.
        let mut block = vec![0u8; 36];
        block[2..4].copy_from_slice(&40i16.to_le_bytes());
        block[4] = 0x07;
        let mut out = vec![0i16; 65];
        decode_ima4_block(&mut out, &block, 1, 65);
        assert_eq!(out[0], 0);
        assert_eq!(out[1], 631);
    }

    #[test]
    fn test_ima4_stereo_interleaving() {
        let mut block = vec![0u8; 72];
        block[0..2].copy_from_slice(&(-5i16).to_le_bytes());
        block[4..6].copy_from_slice(&7i16.to_le_bytes());
        let mut out = vec![0i16; 130];
        decode_ima4_block(&mut out, &block, 2, 65);
        assert_eq!(&out[..4], &[-5, 7, -5, 7]);
    }

    #[test]
    fn test_msadpcm_header_order() {
        let mut block = vec![0u8; 38];
        block[0] = 0; // predictor
        block[1..3].copy_from_slice(&16i16.to_le_bytes());
        block[3..5].copy_from_slice(&200i16.to_le_bytes());
        block[5..7].copy_from_slice(&100i16.to_le_bytes());
        let mut out = vec![0i16; 64];
        decode_msadpcm_block(&mut out, &block, 1, 64);
        assert_eq!(out[0], 100);
        assert_eq!(out[1], 200);
        // Predictor 0 repeats the last sample when the nibble is zero.
        assert_eq!(out[2], 200);
        assert!(out[2..].iter().all(|&s| s == 200));
    }
}
