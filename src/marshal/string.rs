//! String strategies and the text encodings they share.
//!
//! The ANSI code page is Latin-1: every UTF-16 unit up to U+00FF maps to the
//! byte of the same value, everything else is unmappable.
use super::{
    category::NativeFieldCategory,
    cleanup::{block_owner, CleanupEntry, CleanupList},
    reference::ReferenceMarshaler,
    slot::MarshalTag,
    MarshalContext,
};
use crate::{
    config::MarshalConfig,
    error::{MarshalError, NativeError},
    layout::LayoutRegistry,
    value::{native_heap, BlockOwner, NativePtr, ObjectHandle, POINTER_SIZE},
};
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

const BEST_FIT_REPLACEMENT: u8 = b'?';

pub fn ansi_byte(c: u16, config: &MarshalConfig) -> Result<u8, MarshalError> {
    match u8::try_from(c) {
        Ok(b) => Ok(b),
        Err(_) if config.throw_on_unmappable_char => Err(MarshalError::UnmappableChar(c)),
        Err(_) => Ok(BEST_FIT_REPLACEMENT),
    }
}

pub fn encode_ansi(chars: &[u16], config: &MarshalConfig) -> Result<Vec<u8>, MarshalError> {
    chars.iter().map(|c| ansi_byte(*c, config)).collect()
}

pub fn decode_ansi(bytes: &[u8]) -> Vec<u16> {
    bytes.iter().map(|b| *b as u16).collect()
}

fn encode_unicode(chars: &[u16]) -> Vec<u8> {
    chars.iter().flat_map(|c| c.to_le_bytes()).collect()
}

fn decode_unicode(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StringEncoding {
    Ansi,
    Unicode,
    Utf8,
    /// Length-prefixed UTF-16 (`BSTR`).
    Bstr,
}

impl StringEncoding {
    /// Bytes per code unit, which is also the terminator width.
    pub fn unit(self) -> usize {
        match self {
            StringEncoding::Ansi | StringEncoding::Utf8 => 1,
            StringEncoding::Unicode | StringEncoding::Bstr => 2,
        }
    }

    fn encode(self, chars: &[u16], config: &MarshalConfig) -> Result<Vec<u8>, MarshalError> {
        Ok(match self {
            StringEncoding::Ansi => encode_ansi(chars, config)?,
            StringEncoding::Utf8 => String::from_utf16_lossy(chars).into_bytes(),
            StringEncoding::Unicode | StringEncoding::Bstr => encode_unicode(chars),
        })
    }

    fn decode(self, bytes: &[u8]) -> Vec<u16> {
        match self {
            StringEncoding::Ansi => decode_ansi(bytes),
            StringEncoding::Utf8 => String::from_utf8_lossy(bytes).encode_utf16().collect(),
            StringEncoding::Unicode | StringEncoding::Bstr => decode_unicode(bytes),
        }
    }
}

const BSTR_PREFIX: usize = 4;

/// Allocates a `BSTR` and returns the pointer to its first character.
pub fn alloc_bstr(chars: &[u16], owner: BlockOwner) -> Result<NativePtr, NativeError> {
    let byte_len = chars.len() * 2;
    let mut block = Vec::with_capacity(BSTR_PREFIX + byte_len + 2);
    block.extend_from_slice(&(byte_len as u32).to_le_bytes());
    block.extend(encode_unicode(chars));
    block.extend_from_slice(&[0, 0]);
    Ok(native_heap().alloc_bytes_owned(&block, owner)?.offset(BSTR_PREFIX))
}

/// The allocation backing a `BSTR`.
pub fn bstr_block(ptr: NativePtr) -> NativePtr {
    NativePtr(ptr.0.wrapping_sub(BSTR_PREFIX))
}

pub fn read_bstr(ptr: NativePtr) -> Result<Vec<u16>, NativeError> {
    let heap = native_heap();
    let prefix = heap.read(bstr_block(ptr), BSTR_PREFIX)?;
    let byte_len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    Ok(decode_unicode(&heap.read(ptr, byte_len)?))
}

/// Frees a native allocation from a destroy path, where failure can only be
/// logged. Blocks a cleanup list owns are left to the list.
pub(crate) fn release_block(ptr: NativePtr) {
    match native_heap().free_owned(ptr, BlockOwner::Buffer) {
        Ok(true) => {}
        Ok(false) => trace!("{:?} belongs to a cleanup list, not releasing it", ptr),
        Err(e) => warn!("ignoring failed release of {:?}: {}", ptr, e),
    }
}

/// Reuses `previous` if it is a string with exactly these characters.
fn reuse_string(
    cx: &mut MarshalContext<'_>,
    chars: Vec<u16>,
    previous: Option<&ObjectHandle>,
) -> ObjectHandle {
    if let Some(p) = previous {
        if cx.heap.string_chars(p).ok().as_deref() == Some(chars.as_slice()) {
            return p.clone();
        }
    }
    cx.heap.alloc_utf16(chars)
}

/// A string passed by pointer (`LPStr`, `LPWStr`, `LPUTF8Str`, `BStr`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeString {
    pub encoding: StringEncoding,
}

impl ReferenceMarshaler for NativeString {
    fn tag(&self) -> MarshalTag {
        match self.encoding {
            StringEncoding::Ansi => MarshalTag::StringAnsi,
            StringEncoding::Unicode => MarshalTag::StringUni,
            StringEncoding::Utf8 => MarshalTag::StringUtf8,
            StringEncoding::Bstr => MarshalTag::Bstr,
        }
    }

    fn category(&self) -> NativeFieldCategory {
        NativeFieldCategory::INTEGER_LIKE
    }

    fn native_size(&self) -> u32 {
        POINTER_SIZE as u32
    }

    fn alignment_requirement(&self) -> u32 {
        POINTER_SIZE as u32
    }

    fn update_native(
        &self,
        cx: &mut MarshalContext<'_>,
        value: Option<&ObjectHandle>,
        native: &mut [u8],
        cleanup: Option<&mut CleanupList>,
    ) -> Result<(), MarshalError> {
        let Some(value) = value else {
            NativePtr::NULL.write_to(native);
            return Ok(());
        };
        let chars = cx.heap.string_chars(value)?;
        let owner = block_owner(cleanup.as_deref());
        let (ptr, block) = if self.encoding == StringEncoding::Bstr {
            let ptr = alloc_bstr(&chars, owner)?;
            (ptr, bstr_block(ptr))
        } else {
            let mut bytes = self.encoding.encode(&chars, cx.config())?;
            bytes.resize(bytes.len() + self.encoding.unit(), 0);
            let ptr = native_heap().alloc_bytes_owned(&bytes, owner)?;
            (ptr, ptr)
        };
        ptr.write_to(native);
        if let Some(cleanup) = cleanup {
            cleanup.push(CleanupEntry::FreeNative(block));
        }
        Ok(())
    }

    fn update_clr(
        &self,
        cx: &mut MarshalContext<'_>,
        native: &[u8],
        previous: Option<&ObjectHandle>,
    ) -> Result<Option<ObjectHandle>, MarshalError> {
        let ptr = NativePtr::read_from(native);
        if ptr.is_null() {
            return Ok(None);
        }
        let chars = if self.encoding == StringEncoding::Bstr {
            read_bstr(ptr)?
        } else {
            let bytes = native_heap().read_terminated(ptr, self.encoding.unit())?;
            self.encoding.decode(&bytes)
        };
        Ok(Some(reuse_string(cx, chars, previous)))
    }

    fn destroy_native(&self, _registry: &LayoutRegistry, native: &mut [u8]) {
        let ptr = NativePtr::read_from(native);
        if ptr.is_null() {
            return;
        }
        release_block(if self.encoding == StringEncoding::Bstr {
            bstr_block(ptr)
        } else {
            ptr
        });
        NativePtr::NULL.write_to(native);
    }
}

/// A string stored in place as a fixed character buffer (`ByValTStr`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedString {
    pub encoding: StringEncoding,
    /// Capacity in characters, terminator included.
    pub length: u32,
}

impl ReferenceMarshaler for FixedString {
    fn tag(&self) -> MarshalTag {
        match self.encoding {
            StringEncoding::Ansi => MarshalTag::FixedStringAnsi,
            _ => MarshalTag::FixedStringUni,
        }
    }

    fn category(&self) -> NativeFieldCategory {
        NativeFieldCategory::IN_PLACE_ARRAY
    }

    fn native_size(&self) -> u32 {
        self.length.saturating_mul(self.encoding.unit() as u32)
    }

    fn alignment_requirement(&self) -> u32 {
        self.encoding.unit() as u32
    }

    fn update_native(
        &self,
        cx: &mut MarshalContext<'_>,
        value: Option<&ObjectHandle>,
        native: &mut [u8],
        _cleanup: Option<&mut CleanupList>,
    ) -> Result<(), MarshalError> {
        native.fill(0);
        let Some(value) = value else {
            return Ok(());
        };
        let mut chars = cx.heap.string_chars(value)?;
        // always leave room for the terminator
        chars.truncate(self.length.saturating_sub(1) as usize);
        let bytes = self.encoding.encode(&chars, cx.config())?;
        native[..bytes.len()].copy_from_slice(&bytes);
        Ok(())
    }

    fn update_clr(
        &self,
        cx: &mut MarshalContext<'_>,
        native: &[u8],
        previous: Option<&ObjectHandle>,
    ) -> Result<Option<ObjectHandle>, MarshalError> {
        let unit = self.encoding.unit();
        let end = native
            .chunks_exact(unit)
            .position(|c| c.iter().all(|b| *b == 0))
            .map(|i| i * unit)
            .unwrap_or(native.len() - native.len() % unit);
        let chars = self.encoding.decode(&native[..end]);
        Ok(Some(reuse_string(cx, chars, previous)))
    }

    fn destroy_native(&self, _registry: &LayoutRegistry, native: &mut [u8]) {
        native.fill(0);
    }
}
