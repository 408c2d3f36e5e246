//! Serialisation of DNS messages to the wire format.  See the `types`
//! module for details of the format.
//!
//! Serialisation cannot fail: over-long labels are unrepresentable,
//! and the header counts are written exactly as given.  Names are
//! always written uncompressed.

use crate::types::*;

impl Message {
    /// Encode to a freshly allocated datagram.
    pub fn to_octets(&self) -> Vec<u8> {
        let mut buffer = WritableBuffer::default();
        self.serialise(&mut buffer);
        buffer.octets
    }

    pub fn serialise(&self, buffer: &mut WritableBuffer) {
        self.header.serialise(buffer);

        for question in &self.questions {
            question.serialise(buffer);
        }
        for rr in &self.answers {
            rr.serialise(buffer);
        }
        for rr in &self.authority {
            rr.serialise(buffer);
        }
        for rr in &self.additional {
            rr.serialise(buffer);
        }
    }
}

impl Header {
    pub fn serialise(&self, buffer: &mut WritableBuffer) {
        // octet 3
        let flag_qr = if self.is_response { HEADER_MASK_QR } else { 0 };
        let field_opcode =
            HEADER_MASK_OPCODE & (u8::from(self.opcode) << HEADER_OFFSET_OPCODE);
        let flag_aa = if self.is_authoritative {
            HEADER_MASK_AA
        } else {
            0
        };
        let flag_tc = if self.is_truncated { HEADER_MASK_TC } else { 0 };
        let flag_rd = if self.recursion_desired {
            HEADER_MASK_RD
        } else {
            0
        };
        // octet 4, with the Z bits left zero
        let flag_ra = if self.recursion_available {
            HEADER_MASK_RA
        } else {
            0
        };
        let field_rcode = HEADER_MASK_RCODE & u8::from(self.rcode);

        buffer.write_u16(self.id);
        buffer.write_u8(flag_qr | field_opcode | flag_aa | flag_tc | flag_rd);
        buffer.write_u8(flag_ra | field_rcode);
        buffer.write_u16(self.qdcount);
        buffer.write_u16(self.ancount);
        buffer.write_u16(self.nscount);
        buffer.write_u16(self.arcount);
    }
}

impl Question {
    pub fn serialise(&self, buffer: &mut WritableBuffer) {
        self.name.serialise(buffer);
        buffer.write_u16(self.qtype.into());
        buffer.write_u16(self.qclass.into());
    }
}

impl ResourceRecord {
    /// RDATA longer than 65535 octets cannot be represented on the
    /// wire and is a caller error.
    #[allow(clippy::cast_possible_truncation)]
    pub fn serialise(&self, buffer: &mut WritableBuffer) {
        debug_assert!(self.data.len() <= usize::from(u16::MAX));

        self.name.serialise(buffer);
        buffer.write_u16(self.rtype.into());
        buffer.write_u16(self.rclass.into());
        buffer.write_u32(self.ttl);
        buffer.write_u16(self.data.len() as u16);
        buffer.write_octets(&self.data);
    }
}

impl DomainName {
    /// One length octet and the label octets per label, then the
    /// terminating zero.  No compression: suffixes are never shared
    /// across names.
    #[allow(clippy::cast_possible_truncation)]
    pub fn serialise(&self, buffer: &mut WritableBuffer) {
        for label in &self.labels {
            // a Label cannot exceed 63 octets
            buffer.write_u8(label.len() as u8);
            buffer.write_octets(label.octets());
        }
        buffer.write_u8(0);
    }

    /// The wire encoding of just this name, as used when a name forms
    /// the whole RDATA of an NS, CNAME, or PTR record.
    pub fn to_octets(&self) -> Vec<u8> {
        let mut buffer = WritableBuffer::default();
        self.serialise(&mut buffer);
        buffer.octets
    }
}

/// A buffer which can be written to, for serialisation purposes.
pub struct WritableBuffer {
    pub octets: Vec<u8>,
}

impl Default for WritableBuffer {
    fn default() -> Self {
        Self {
            octets: Vec::with_capacity(512),
        }
    }
}

impl WritableBuffer {
    pub fn write_u8(&mut self, octet: u8) {
        self.octets.push(octet);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.octets.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.octets.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_octets(&mut self, octets: &[u8]) {
        self.octets.extend_from_slice(octets);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_util::*;

    fn all_flags_header() -> Header {
        Header {
            id: 300,
            is_response: true,
            opcode: Opcode::Inverse,
            is_authoritative: true,
            is_truncated: true,
            recursion_desired: true,
            recursion_available: true,
            rcode: Rcode::Refused,
            qdcount: 257,
            ancount: 2,
            nscount: 65535,
            arcount: 512,
        }
    }

    #[test]
    fn serialise_header_packs_every_field() {
        let mut buffer = WritableBuffer::default();
        all_flags_header().serialise(&mut buffer);

        assert_eq!(
            vec![0x01, 0x2C, 0x8F, 0x85, 0x01, 0x01, 0x00, 0x02, 0xFF, 0xFF, 0x02, 0x00],
            buffer.octets,
        );
    }

    #[test]
    fn serialise_header_counts_are_written_verbatim() {
        // the header-only encode: counts need not match the (empty)
        // sections
        let message = Message {
            header: all_flags_header(),
            questions: Vec::new(),
            answers: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
        };

        assert_eq!(12, message.to_octets().len());
    }

    #[test]
    #[rustfmt::skip]
    fn serialise_question() {
        let mut header = all_flags_header();
        header.qdcount = 1;
        header.ancount = 0;
        header.nscount = 0;
        header.arcount = 0;

        let message = Message {
            header,
            questions: vec![question("google.com", RecordType::NS)],
            answers: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
        };

        assert_eq!(
            vec![
                0x01, 0x2C, 0x8F, 0x85, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
                6, b'g', b'o', b'o', b'g', b'l', b'e',
                3, b'c', b'o', b'm',
                0,
                0, 2, // NS
                0, 1, // IN
            ],
            message.to_octets(),
        );
    }

    #[test]
    #[rustfmt::skip]
    fn serialise_resourcerecord_sets_rdlength() {
        let mut buffer = WritableBuffer::default();
        buffer.write_u8(1);
        buffer.write_u8(2);
        buffer.write_u8(3);
        buffer.write_u8(4);

        let rr = a_record("google.com", std::net::Ipv4Addr::new(8, 8, 8, 8));
        rr.serialise(&mut buffer);

        assert_eq!(
            vec![
                1, 2, 3, 4,
                // NAME
                6, b'g', b'o', b'o', b'g', b'l', b'e',
                3, b'c', b'o', b'm',
                0,
                // TYPE
                0, 1, // A
                // CLASS
                0, 1, // IN
                // TTL
                0, 0, 0x01, 0x2C, // 300
                // RDLENGTH
                0, 4,
                // RDATA
                8, 8, 8, 8,
            ],
            buffer.octets,
        );
    }

    #[test]
    fn serialise_root_name_is_a_single_zero() {
        let mut buffer = WritableBuffer::default();
        DomainName::root().serialise(&mut buffer);

        assert_eq!(vec![0], buffer.octets);
    }

    #[test]
    fn to_octets_encodes_name_uncompressed() {
        assert_eq!(
            vec![3, b'd', b'n', b's', 6, b'g', b'o', b'o', b'g', b'l', b'e', 3, b'c', b'o', b'm', 0],
            domain("dns.google.com").to_octets(),
        );
    }
}
