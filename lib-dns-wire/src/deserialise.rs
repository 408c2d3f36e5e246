//! Deserialisation of DNS messages from the network.  See the `types`
//! module for details of the format.
//!
//! Parsing works through a `ConsumableBuffer`, a cursor over the full
//! datagram.  Keeping the whole datagram around matters because name
//! compression pointers are absolute offsets into it.  Trailing
//! octets past the counted records are ignored, since receive buffers
//! are larger than most messages.

use bytes::Bytes;
use std::fmt;

use crate::types::*;

impl Message {
    pub fn from_octets(octets: &[u8]) -> Result<Self, Error> {
        Self::deserialise(&mut ConsumableBuffer::new(octets))
    }

    /// Reads the header, then exactly as many questions and records
    /// as the header counts declare, in section order.  Label octets
    /// are copied out of the buffer, so the decoded message does not
    /// borrow it.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let header = Header::deserialise(buffer)?;
        let mut questions = Vec::with_capacity(header.qdcount.into());
        let mut answers = Vec::with_capacity(header.ancount.into());
        let mut authority = Vec::with_capacity(header.nscount.into());
        let mut additional = Vec::with_capacity(header.arcount.into());

        for _ in 0..header.qdcount {
            questions.push(Question::deserialise(header.id, buffer)?);
        }
        for _ in 0..header.ancount {
            answers.push(ResourceRecord::deserialise(header.id, buffer)?);
        }
        for _ in 0..header.nscount {
            authority.push(ResourceRecord::deserialise(header.id, buffer)?);
        }
        for _ in 0..header.arcount {
            additional.push(ResourceRecord::deserialise(header.id, buffer)?);
        }

        Ok(Self {
            header,
            questions,
            answers,
            authority,
            additional,
        })
    }
}

impl Header {
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let id = buffer.next_u16().ok_or(Error::CompletelyBusted)?;
        let flags1 = buffer.next_u8().ok_or(Error::HeaderTooShort(id))?;
        let flags2 = buffer.next_u8().ok_or(Error::HeaderTooShort(id))?;
        let qdcount = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;
        let ancount = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;
        let nscount = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;
        let arcount = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;

        Ok(Self {
            id,
            is_response: flags1 & HEADER_MASK_QR != 0,
            opcode: Opcode::from((flags1 & HEADER_MASK_OPCODE) >> HEADER_OFFSET_OPCODE),
            is_authoritative: flags1 & HEADER_MASK_AA != 0,
            is_truncated: flags1 & HEADER_MASK_TC != 0,
            recursion_desired: flags1 & HEADER_MASK_RD != 0,
            // the Z bits of flags2 are ignored, not rejected
            recursion_available: flags2 & HEADER_MASK_RA != 0,
            rcode: Rcode::from(flags2 & HEADER_MASK_RCODE),
            qdcount,
            ancount,
            nscount,
            arcount,
        })
    }
}

impl Question {
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let name = DomainName::deserialise(id, buffer)?;
        let qtype = buffer.next_u16().ok_or(Error::QuestionTooShort(id))?;
        let qclass = buffer.next_u16().ok_or(Error::QuestionTooShort(id))?;

        Ok(Self {
            name,
            qtype: RecordType::from(qtype),
            qclass: RecordClass::from(qclass),
        })
    }
}

impl ResourceRecord {
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        Ok(Self::deserialise_tracking(id, buffer)?.0)
    }

    /// Like `deserialise`, but also reports the absolute offset at
    /// which the RDATA started.  The RDATA is taken verbatim: names
    /// embedded in it are not expanded here, see `DomainName::scan`.
    fn deserialise_tracking(
        id: u16,
        buffer: &mut ConsumableBuffer,
    ) -> Result<(Self, usize), Error> {
        let name = DomainName::deserialise(id, buffer)?;
        let rtype = buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?;
        let rclass = buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?;
        let ttl = buffer.next_u32().ok_or(Error::ResourceRecordTooShort(id))?;
        let rdlength = buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?;

        let rdata_offset = buffer.position();
        let data = buffer
            .take(rdlength as usize)
            .ok_or(Error::ResourceRecordTooShort(id))?;

        Ok((
            Self {
                name,
                rtype: RecordType::from(rtype),
                rclass: RecordClass::from(rclass),
                ttl,
                data: Bytes::copy_from_slice(data),
            },
            rdata_offset,
        ))
    }
}

impl DomainName {
    /// Read a name label-by-label from the buffer's cursor.  A length
    /// octet with both top bits set is a 14-bit pointer: decoding
    /// continues at that absolute offset, and the pointer ends the
    /// name's presence in the current stream.  A pointer target must
    /// lie strictly before the start of the name being decoded, which
    /// rules out forward references and cycles (RFC 1035 section
    /// 4.1.4 only permits pointers to prior occurrences).
    #[allow(clippy::missing_panics_doc)]
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let mut labels = Vec::<Label>::with_capacity(5);
        let mut label_octets = 0;
        let start = buffer.position();

        loop {
            let size = buffer.next_u8().ok_or(Error::DomainTooShort(id))?;

            if size == 0 {
                break;
            } else if usize::from(size) <= LABEL_MAX_LEN {
                let Some(octets) = buffer.take(size as usize) else {
                    return Err(Error::DomainTooShort(id));
                };

                label_octets += octets.len();
                if label_octets > NAME_MAX_LEN {
                    return Err(Error::DomainTooLong(id));
                }

                // safe because of the bounds check above
                labels.push(Label::try_from(octets).unwrap());
            } else if size & 0b1100_0000 == 0b1100_0000 {
                let hi = size & 0b0011_1111;
                let lo = buffer.next_u8().ok_or(Error::DomainTooShort(id))?;
                let ptr = usize::from(u16::from_be_bytes([hi, lo]));

                if ptr >= start {
                    return Err(Error::DomainPointerInvalid(id));
                }

                let mut rest = DomainName::deserialise(id, &mut buffer.at_offset(ptr))?;
                label_octets += rest.labels.iter().map(Label::len).sum::<usize>();
                if label_octets > NAME_MAX_LEN {
                    return Err(Error::DomainTooLong(id));
                }

                labels.append(&mut rest.labels);
                break;
            } else {
                // 0b01 and 0b10 top bit patterns are reserved
                return Err(Error::DomainLabelInvalid(id));
            }
        }

        Ok(DomainName { labels })
    }

    /// Decode the name starting at an absolute offset of a full
    /// datagram.  This is how names embedded in RDATA are recovered:
    /// the RDATA octets sit at a known offset (see [`rdata_offsets`])
    /// and any pointers in them resolve against the whole datagram.
    pub fn scan(datagram: &[u8], offset: usize) -> Result<Self, Error> {
        Self::scan_counted(datagram, offset).map(|(name, _)| name)
    }

    /// Like `scan`, but also reports how many octets the name
    /// occupied in the stream at `offset` (a pointer counts as its
    /// own two octets, not as the octets it points at).  Callers can
    /// check this against an RDLENGTH to confirm a name is the whole
    /// of an RDATA.
    pub fn scan_counted(datagram: &[u8], offset: usize) -> Result<(Self, usize), Error> {
        let mut buffer = ConsumableBuffer::new(datagram);
        let id = buffer.next_u16().ok_or(Error::CompletelyBusted)?;

        let mut cursor = buffer.at_offset(offset);
        let name = Self::deserialise(id, &mut cursor)?;
        Ok((name, cursor.position() - offset))
    }
}

/// The absolute RDATA offset of every resource record in a datagram,
/// grouped by section and in section order.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SectionOffsets {
    pub answers: Vec<usize>,
    pub authority: Vec<usize>,
    pub additional: Vec<usize>,
}

/// Re-walk a datagram and report where each record's RDATA starts.
/// Fails exactly when `Message::from_octets` fails, so on a datagram
/// that already decoded this cannot error in practice.
pub fn rdata_offsets(octets: &[u8]) -> Result<SectionOffsets, Error> {
    let mut buffer = ConsumableBuffer::new(octets);
    let header = Header::deserialise(&mut buffer)?;

    for _ in 0..header.qdcount {
        Question::deserialise(header.id, &mut buffer)?;
    }

    let mut offsets = SectionOffsets {
        answers: Vec::with_capacity(header.ancount.into()),
        authority: Vec::with_capacity(header.nscount.into()),
        additional: Vec::with_capacity(header.arcount.into()),
    };

    for _ in 0..header.ancount {
        let (_, offset) = ResourceRecord::deserialise_tracking(header.id, &mut buffer)?;
        offsets.answers.push(offset);
    }
    for _ in 0..header.nscount {
        let (_, offset) = ResourceRecord::deserialise_tracking(header.id, &mut buffer)?;
        offsets.authority.push(offset);
    }
    for _ in 0..header.arcount {
        let (_, offset) = ResourceRecord::deserialise_tracking(header.id, &mut buffer)?;
        offsets.additional.push(offset);
    }

    Ok(offsets)
}

/// Errors encountered when parsing a datagram.  In all the errors
/// which have a `u16` parameter, that is the ID from the header - so
/// that an error response can be sent.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error {
    /// The datagram is not even 2 octets long, so it doesn't even
    /// contain a valid ID.  An error response cannot be sent in this
    /// case as, without an ID, it cannot be linked with the query.
    CompletelyBusted,

    /// The header is missing one or more required fields.
    HeaderTooShort(u16),

    /// A question ends with an incomplete field.
    QuestionTooShort(u16),

    /// A resource record ends with an incomplete field, or its
    /// RDLENGTH runs past the end of the datagram.
    ResourceRecordTooShort(u16),

    /// A domain is incomplete.
    DomainTooShort(u16),

    /// A domain decodes to over 255 label octets.
    DomainTooLong(u16),

    /// A domain pointer does not point strictly before the domain.
    DomainPointerInvalid(u16),

    /// A domain label length has a reserved top-bit pattern.
    DomainLabelInvalid(u16),
}

impl Error {
    pub fn id(self) -> Option<u16> {
        match self {
            Error::CompletelyBusted => None,
            Error::HeaderTooShort(id)
            | Error::QuestionTooShort(id)
            | Error::ResourceRecordTooShort(id)
            | Error::DomainTooShort(id)
            | Error::DomainTooLong(id)
            | Error::DomainPointerInvalid(id)
            | Error::DomainLabelInvalid(id) => Some(id),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::CompletelyBusted => write!(f, "datagram too short to hold an ID"),
            Error::HeaderTooShort(_) => write!(f, "header too short"),
            Error::QuestionTooShort(_) => write!(f, "question too short"),
            Error::ResourceRecordTooShort(_) => write!(f, "resource record too short"),
            Error::DomainTooShort(_) => write!(f, "domain name incomplete"),
            Error::DomainTooLong(_) => write!(f, "domain name over 255 octets"),
            Error::DomainPointerInvalid(_) => write!(f, "domain pointer not strictly earlier"),
            Error::DomainLabelInvalid(_) => write!(f, "domain label length reserved bits set"),
        }
    }
}

impl std::error::Error for Error {}

/// A buffer which will be consumed by the parsing process.
pub struct ConsumableBuffer<'a> {
    octets: &'a [u8],
    position: usize,
}

impl<'a> ConsumableBuffer<'a> {
    pub fn new(octets: &'a [u8]) -> Self {
        Self { octets, position: 0 }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn next_u8(&mut self) -> Option<u8> {
        if self.octets.len() > self.position {
            let a = self.octets[self.position];
            self.position += 1;
            Some(a)
        } else {
            None
        }
    }

    pub fn next_u16(&mut self) -> Option<u16> {
        if self.octets.len() > self.position + 1 {
            let a = self.octets[self.position];
            let b = self.octets[self.position + 1];
            self.position += 2;
            Some(u16::from_be_bytes([a, b]))
        } else {
            None
        }
    }

    pub fn next_u32(&mut self) -> Option<u32> {
        if self.octets.len() > self.position + 3 {
            let a = self.octets[self.position];
            let b = self.octets[self.position + 1];
            let c = self.octets[self.position + 2];
            let d = self.octets[self.position + 3];
            self.position += 4;
            Some(u32::from_be_bytes([a, b, c, d]))
        } else {
            None
        }
    }

    pub fn take(&mut self, size: usize) -> Option<&'a [u8]> {
        if self.octets.len() >= self.position + size {
            let slice = &self.octets[self.position..self.position + size];
            self.position += size;
            Some(slice)
        } else {
            None
        }
    }

    /// A fresh cursor over the same datagram, for pointer chasing.
    /// Does not advance this cursor.
    pub fn at_offset(&self, position: usize) -> ConsumableBuffer<'a> {
        Self {
            octets: self.octets,
            position,
        }
    }
}
