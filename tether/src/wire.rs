//! Frame headers and primitive wire encodings. Integers are little-endian;
//! strings are length-prefixed UTF-16-LE.

use crate::error::{RemotingError, RemotingResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Upper bound on a single decoded string, in UTF-16 code units.
const MAX_STRING_UNITS: usize = 1 << 20;
/// Upper bound on a single inline payload.
const MAX_BLOB_BYTES: usize = 1 << 26;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FunctionType {
    CreateInstanceWithDefaultCtor = 1,
    CreateInstance = 2,
    MethodCall = 3,
    MethodReply = 4,
    ExceptionReturn = 5,
    OpenReverseChannel = 6,
    GcCleanup = 7,
    ShutdownServer = 8,
    ServerShuttingDown = 9,
}

impl From<FunctionType> for u32 {
    #[inline]
    fn from(function: FunctionType) -> Self {
        function as u32
    }
}

impl FunctionType {
    pub fn from_u32(raw: u32) -> RemotingResult<FunctionType> {
        Ok(match raw {
            1 => FunctionType::CreateInstanceWithDefaultCtor,
            2 => FunctionType::CreateInstance,
            3 => FunctionType::MethodCall,
            4 => FunctionType::MethodReply,
            5 => FunctionType::ExceptionReturn,
            6 => FunctionType::OpenReverseChannel,
            7 => FunctionType::GcCleanup,
            8 => FunctionType::ShutdownServer,
            9 => FunctionType::ServerShuttingDown,
            other => {
                return Err(RemotingError::Protocol(format!(
                    "unknown function type {}",
                    other
                )))
            }
        })
    }
}

/// Every logical message starts with one of these.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CallHeader {
    pub function: FunctionType,
    pub sequence: i32,
}

impl CallHeader {
    #[inline]
    pub fn new(function: FunctionType, sequence: i32) -> CallHeader {
        CallHeader { function, sequence }
    }

    #[inline]
    pub fn write<W: Write + ?Sized>(&self, stream: &mut W) -> RemotingResult<()> {
        stream.write_u32::<LittleEndian>(self.function.into())?;
        stream.write_i32::<LittleEndian>(self.sequence)?;
        Ok(())
    }

    #[inline]
    pub fn read<R: Read>(stream: &mut R) -> RemotingResult<CallHeader> {
        let function = FunctionType::from_u32(stream.read_u32::<LittleEndian>()?)?;
        let sequence = stream.read_i32::<LittleEndian>()?;
        Ok(CallHeader { function, sequence })
    }
}

/// Tag prepended to every argument that may carry an object reference.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReferenceTag {
    NullPointer = 0,
    SerializedItem = 1,
    NewProxy = 2,
    RemoteReference = 3,
    InstanceOfSystemType = 4,
    ArrayOfSystemType = 5,
    MethodPointer = 6,
}

impl From<ReferenceTag> for u32 {
    #[inline]
    fn from(tag: ReferenceTag) -> Self {
        tag as u32
    }
}

impl ReferenceTag {
    pub fn from_u32(raw: u32) -> RemotingResult<ReferenceTag> {
        Ok(match raw {
            0 => ReferenceTag::NullPointer,
            1 => ReferenceTag::SerializedItem,
            2 => ReferenceTag::NewProxy,
            3 => ReferenceTag::RemoteReference,
            4 => ReferenceTag::InstanceOfSystemType,
            5 => ReferenceTag::ArrayOfSystemType,
            6 => ReferenceTag::MethodPointer,
            other => {
                return Err(RemotingError::Protocol(format!(
                    "unknown reference tag {}",
                    other
                )))
            }
        })
    }

    #[inline]
    pub fn write<W: Write + ?Sized>(&self, stream: &mut W) -> RemotingResult<()> {
        stream.write_u32::<LittleEndian>((*self).into()).map_err(Into::into)
    }

    #[inline]
    pub fn read<R: Read>(stream: &mut R) -> RemotingResult<ReferenceTag> {
        ReferenceTag::from_u32(stream.read_u32::<LittleEndian>()?)
    }
}

/// Write a length-prefixed UTF-16-LE string. The prefix counts code units.
pub fn write_str<W: Write + ?Sized>(stream: &mut W, value: &str) -> RemotingResult<()> {
    let units: Vec<u16> = value.encode_utf16().collect();

    stream.write_i32::<LittleEndian>(units.len() as i32)?;
    for unit in units {
        stream.write_u16::<LittleEndian>(unit)?;
    }

    Ok(())
}

pub fn read_str<R: Read>(stream: &mut R) -> RemotingResult<String> {
    let count = stream.read_i32::<LittleEndian>()?;

    if count < 0 || count as usize > MAX_STRING_UNITS {
        return Err(RemotingError::Protocol(format!(
            "string length {} out of bounds",
            count
        )));
    }

    let mut units = Vec::with_capacity(count as usize);
    for _ in 0..count {
        units.push(stream.read_u16::<LittleEndian>()?);
    }

    String::from_utf16(&units)
        .map_err(|_| RemotingError::Protocol("malformed utf-16 string".to_string()))
}

/// Write a length-prefixed opaque payload.
pub fn write_blob<W: Write + ?Sized>(stream: &mut W, payload: &[u8]) -> RemotingResult<()> {
    stream.write_i32::<LittleEndian>(payload.len() as i32)?;
    stream.write_all(payload)?;
    Ok(())
}

pub fn read_blob<R: Read>(stream: &mut R) -> RemotingResult<Vec<u8>> {
    let count = stream.read_i32::<LittleEndian>()?;

    if count < 0 || count as usize > MAX_BLOB_BYTES {
        return Err(RemotingError::Protocol(format!(
            "payload length {} out of bounds",
            count
        )));
    }

    let mut payload = vec![0u8; count as usize];
    stream.read_exact(&mut payload)?;
    Ok(payload)
}

pub fn write_str_list<W: Write + ?Sized>(stream: &mut W, values: &[String]) -> RemotingResult<()> {
    stream.write_i32::<LittleEndian>(values.len() as i32)?;
    for value in values {
        write_str(stream, value)?;
    }
    Ok(())
}

pub fn read_str_list<R: Read>(stream: &mut R) -> RemotingResult<Vec<String>> {
    let count = stream.read_i32::<LittleEndian>()?;

    if count < 0 || count as usize > MAX_STRING_UNITS {
        return Err(RemotingError::Protocol(format!(
            "list length {} out of bounds",
            count
        )));
    }

    let mut values = Vec::with_capacity(count as usize);
    for _ in 0..count {
        values.push(read_str(stream)?);
    }
    Ok(values)
}
