//! Lib0 v1 decoding for payloads that arrive from peers.
//!
//! Yrs' stock decoder hands string bytes to `from_utf8_unchecked`. A single
//! corrupt byte inside a text item is undefined behaviour there, so every
//! peer payload is decoded through [`CheckedDecoder`], which validates each
//! string and turns bad UTF-8 into an ordinary decode error.

use std::sync::Arc;

use yrs::block::ClientID;
use yrs::encoding::read::{Cursor, Error, Read};
use yrs::updates::decoder::{Decode, Decoder, DecoderV1};
use yrs::{Any, ID};

pub(crate) struct CheckedDecoder<'a> {
    inner: DecoderV1<'a>,
}

impl<'a> CheckedDecoder<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self {
            inner: DecoderV1::new(Cursor::new(bytes)),
        }
    }
}

/// Decode `bytes` as lib0 v1, rejecting strings that are not UTF-8.
pub(crate) fn decode_v1<T: Decode>(bytes: &[u8]) -> Result<T, Error> {
    T::decode(&mut CheckedDecoder::new(bytes))
}

impl Read for CheckedDecoder<'_> {
    #[inline]
    fn read_exact(&mut self, len: usize) -> Result<&[u8], Error> {
        self.inner.read_exact(len)
    }

    #[inline]
    fn read_u8(&mut self) -> Result<u8, Error> {
        self.inner.read_u8()
    }

    fn read_string(&mut self) -> Result<&str, Error> {
        let buf = self.read_buf()?;
        std::str::from_utf8(buf).map_err(|_| Error::UnexpectedValue)
    }
}

impl Decoder for CheckedDecoder<'_> {
    #[inline]
    fn reset_ds_cur_val(&mut self) {
        self.inner.reset_ds_cur_val()
    }

    #[inline]
    fn read_ds_clock(&mut self) -> Result<u32, Error> {
        self.inner.read_ds_clock()
    }

    #[inline]
    fn read_ds_len(&mut self) -> Result<u32, Error> {
        self.inner.read_ds_len()
    }

    #[inline]
    fn read_left_id(&mut self) -> Result<ID, Error> {
        self.inner.read_left_id()
    }

    #[inline]
    fn read_right_id(&mut self) -> Result<ID, Error> {
        self.inner.read_right_id()
    }

    #[inline]
    fn read_client(&mut self) -> Result<ClientID, Error> {
        self.inner.read_client()
    }

    #[inline]
    fn read_info(&mut self) -> Result<u8, Error> {
        self.inner.read_info()
    }

    #[inline]
    fn read_parent_info(&mut self) -> Result<bool, Error> {
        self.inner.read_parent_info()
    }

    #[inline]
    fn read_type_ref(&mut self) -> Result<u8, Error> {
        self.inner.read_type_ref()
    }

    #[inline]
    fn read_len(&mut self) -> Result<u32, Error> {
        self.inner.read_len()
    }

    // The three below must route through `read_string` above, never the
    // inner decoder's.
    fn read_any(&mut self) -> Result<Any, Error> {
        Any::decode(self)
    }

    fn read_json(&mut self) -> Result<Any, Error> {
        let src = self.read_string()?;
        Any::from_json(src)
    }

    fn read_key(&mut self) -> Result<Arc<str>, Error> {
        Ok(self.read_string()?.into())
    }

    #[inline]
    fn read_to_end(&mut self) -> Result<&[u8], Error> {
        self.inner.read_to_end()
    }
}
