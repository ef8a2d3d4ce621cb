//! CEA-608/708 caption packing and SEI rendering per ATSC A/53.

use bytes::{BufMut, Bytes, BytesMut};

/// `user_data_registered_itu_t_t35`
const SEI_PAYLOAD_TYPE_T35: u8 = 4;
const NAL_TYPE_SEI: u8 = 0x06;

const T35_COUNTRY_CODE_US: u8 = 0xB5;
const T35_PROVIDER_ATSC: u16 = 0x0031;
const ATSC_USER_IDENTIFIER: &[u8; 4] = b"GA94";
const ATSC_USER_DATA_TYPE_CC: u8 = 0x03;

// EIA-608 channel-1 control codes
const EIA608_RCL: u16 = 0x1420; // resume caption loading
const EIA608_EDM: u16 = 0x142C; // erase displayed memory
const EIA608_EOC: u16 = 0x142F; // end of caption (flip memories)
const EIA608_PAC_ROW15: u16 = 0x1460; // bottom row, white, no indent

fn odd_parity(byte: u8) -> bool {
    byte.count_ones() % 2 == 1
}

/// Applies the EIA-608 odd-parity bit to a 7-bit value.
pub(crate) fn eia608_parity_byte(byte: u8) -> u8 {
    let byte = byte & 0x7F;
    if odd_parity(byte) { byte } else { byte | 0x80 }
}

fn eia608_parity_word(word: u16) -> u16 {
    let [hi, lo] = word.to_be_bytes();
    u16::from_be_bytes([eia608_parity_byte(hi), eia608_parity_byte(lo)])
}

/// Verifies the odd-parity rule on both bytes of a 608 word.
pub(crate) fn eia608_parity_verify(word: u16) -> bool {
    let [hi, lo] = word.to_be_bytes();
    odd_parity(hi) && odd_parity(lo)
}

/// One cc_data tuple inside an A/53 caption payload.
#[derive(Debug, Clone, Copy)]
struct CcData {
    cc_valid: bool,
    cc_type: u8,
    data: u16,
}

/// Accumulates cc_data tuples and renders them as one A/53 user-data blob.
#[derive(Debug, Default)]
pub(crate) struct Cea708Frame {
    cc: Vec<CcData>,
}

impl Cea708Frame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_cc_data(&mut self, cc_valid: bool, cc_type: u8, data: u16) {
        self.cc.push(CcData {
            cc_valid,
            cc_type: cc_type & 0x03,
            data,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.cc.is_empty()
    }

    /// Renders the `itu_t_t35` SEI payload bytes.
    pub fn render_t35(&self) -> Bytes {
        let cc_count = self.cc.len().min(31) as u8;

        let mut data = BytesMut::with_capacity(11 + 3 * cc_count as usize);
        data.put_u8(T35_COUNTRY_CODE_US);
        data.put_u16(T35_PROVIDER_ATSC);
        data.put_slice(ATSC_USER_IDENTIFIER);
        data.put_u8(ATSC_USER_DATA_TYPE_CC);
        // process_cc_data_flag + cc_count
        data.put_u8(0x40 | cc_count);
        data.put_u8(0xFF); // em_data
        for cc in self.cc.iter().take(cc_count as usize) {
            let valid = if cc.cc_valid { 0x04 } else { 0x00 };
            data.put_u8(0xF8 | valid | cc.cc_type);
            data.put_u16(cc.data);
        }
        data.put_u8(0xFF); // marker_bits
        data.freeze()
    }
}

/// Encodes one caption line as an EIA-608 pop-on sequence: load off-screen,
/// position at the bottom row, write characters, erase and flip.
pub(crate) fn eia608_encode_line(text: &str) -> Vec<u16> {
    let mut words = Vec::with_capacity(text.len() / 2 + 4);
    words.push(eia608_parity_word(EIA608_RCL));
    words.push(eia608_parity_word(EIA608_PAC_ROW15));

    let mut chars = text.bytes().map(|byte| match byte {
        0x20..=0x7E => byte,
        _ => b' ',
    });
    while let Some(first) = chars.next() {
        let second = chars.next().unwrap_or(0);
        words.push(u16::from_be_bytes([
            eia608_parity_byte(first),
            eia608_parity_byte(second),
        ]));
    }

    words.push(eia608_parity_word(EIA608_EDM));
    words.push(eia608_parity_word(EIA608_EOC));
    words
}

/// Renders a complete SEI NAL unit (without a start code) carrying the
/// given t35 payload: header, payload sizing, RBSP trailing bits and
/// emulation prevention over the full RBSP.
pub(crate) fn render_sei(t35_payload: &[u8]) -> Bytes {
    let mut rbsp = BytesMut::with_capacity(t35_payload.len() + 8);
    rbsp.put_u8(SEI_PAYLOAD_TYPE_T35);

    let mut size = t35_payload.len();
    while size >= 255 {
        rbsp.put_u8(0xFF);
        size -= 255;
    }
    rbsp.put_u8(size as u8);
    rbsp.put_slice(t35_payload);
    rbsp.put_u8(0x80); // rbsp_trailing_bits

    let mut nal = BytesMut::with_capacity(rbsp.len() + 8);
    nal.put_u8(NAL_TYPE_SEI);
    let mut zeros = 0usize;
    for &byte in rbsp.iter() {
        if zeros >= 2 && byte <= 0x03 {
            nal.put_u8(0x03); // emulation prevention
            zeros = 0;
        }
        nal.put_u8(byte);
        zeros = if byte == 0 { zeros + 1 } else { 0 };
    }
    nal.freeze()
}
