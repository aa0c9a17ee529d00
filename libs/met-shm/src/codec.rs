//! Recursive serializer/deserializer for the slot byte layout (spec §4.5):
//!
//! ```text
//! slot = header || array_stream
//! header = bytes_used:usize || num_arrays:usize
//! array  = class_id:u8 complex_flag:u8 ndims:usize dim[0..ndims]:usize payload
//! ```
//!
//! `usize` fields are encoded as native-endian `u64` on the wire (not the
//! host's native `usize` width) so that the layout is identical regardless
//! of how the server and a child controller were each compiled.

use met_proto::MetError;

use crate::array::{Array, NumericClass, CLASS_CELL, CLASS_CHAR, CLASS_LOGICAL, CLASS_STRUCT};

/// Two `u64` words: `bytes_used`, `num_arrays`.
pub const HEADER_SIZE: usize = 16;

pub fn encode_header(buf: &mut [u8], bytes_used: usize, num_arrays: usize) {
    buf[0..8].copy_from_slice(&(bytes_used as u64).to_ne_bytes());
    buf[8..16].copy_from_slice(&(num_arrays as u64).to_ne_bytes());
}

pub fn decode_header(buf: &[u8]) -> (usize, usize) {
    let bytes_used = u64::from_ne_bytes(buf[0..8].try_into().unwrap()) as usize;
    let num_arrays = u64::from_ne_bytes(buf[8..16].try_into().unwrap()) as usize;
    (bytes_used, num_arrays)
}

struct Encoder<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Encoder<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Encoder { buf, pos: 0 }
    }

    fn ensure(&self, n: usize) -> Result<(), MetError> {
        if self.pos + n > self.buf.len() {
            Err(MetError::Intrn)
        } else {
            Ok(())
        }
    }

    fn write_u8(&mut self, v: u8) -> Result<(), MetError> {
        self.ensure(1)?;
        self.buf[self.pos] = v;
        self.pos += 1;
        Ok(())
    }

    fn write_u64(&mut self, v: u64) -> Result<(), MetError> {
        self.ensure(8)?;
        self.buf[self.pos..self.pos + 8].copy_from_slice(&v.to_ne_bytes());
        self.pos += 8;
        Ok(())
    }

    fn write_i32(&mut self, v: i32) -> Result<(), MetError> {
        self.ensure(4)?;
        self.buf[self.pos..self.pos + 4].copy_from_slice(&v.to_ne_bytes());
        self.pos += 4;
        Ok(())
    }

    fn write_bytes(&mut self, b: &[u8]) -> Result<(), MetError> {
        self.ensure(b.len())?;
        self.buf[self.pos..self.pos + b.len()].copy_from_slice(b);
        self.pos += b.len();
        Ok(())
    }

    fn write_cstr(&mut self, s: &str) -> Result<(), MetError> {
        self.write_bytes(s.as_bytes())?;
        self.write_u8(0)
    }

    fn write_dims(&mut self, dims: &[usize]) -> Result<(), MetError> {
        self.write_u64(dims.len() as u64)?;
        for d in dims {
            self.write_u64(*d as u64)?;
        }
        Ok(())
    }
}

struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Decoder { buf, pos: 0 }
    }

    fn remaining(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], MetError> {
        if self.pos + n > self.buf.len() {
            return Err(MetError::Intrn);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8, MetError> {
        Ok(self.take(1)?[0])
    }

    fn read_u64(&mut self) -> Result<u64, MetError> {
        Ok(u64::from_ne_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_i32(&mut self) -> Result<i32, MetError> {
        Ok(i32::from_ne_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, MetError> {
        Ok(self.take(n)?.to_vec())
    }

    fn read_cstr(&mut self) -> Result<String, MetError> {
        let rest = self.remaining();
        let nul = rest.iter().position(|&b| b == 0).ok_or(MetError::Intrn)?;
        let s = std::str::from_utf8(&rest[..nul])
            .map_err(|_| MetError::Intrn)?
            .to_owned();
        self.pos += nul + 1;
        Ok(s)
    }

    fn read_dims(&mut self) -> Result<Vec<usize>, MetError> {
        let ndims = self.read_u64()? as usize;
        let mut dims = Vec::with_capacity(ndims);
        for _ in 0..ndims {
            dims.push(self.read_u64()? as usize);
        }
        Ok(dims)
    }
}

fn encode_array(enc: &mut Encoder, array: &Array) -> Result<(), MetError> {
    match array {
        Array::Numeric {
            class,
            dims,
            real,
            imag,
        } => {
            enc.write_u8(class.class_id())?;
            enc.write_u8(imag.is_some() as u8)?;
            enc.write_dims(dims)?;
            enc.write_bytes(real)?;
            if let Some(imag) = imag {
                enc.write_bytes(imag)?;
            }
        }
        Array::Logical { dims, bytes } => {
            enc.write_u8(CLASS_LOGICAL)?;
            enc.write_u8(0)?;
            enc.write_dims(dims)?;
            enc.write_bytes(bytes)?;
        }
        Array::Char { dims, bytes } => {
            enc.write_u8(CLASS_CHAR)?;
            enc.write_u8(0)?;
            enc.write_dims(dims)?;
            enc.write_bytes(bytes)?;
        }
        Array::Cell { dims, children } => {
            enc.write_u8(CLASS_CELL)?;
            enc.write_u8(0)?;
            enc.write_dims(dims)?;
            for child in children {
                encode_array(enc, child)?;
            }
        }
        Array::Struct {
            dims,
            fields,
            cells,
        } => {
            enc.write_u8(CLASS_STRUCT)?;
            enc.write_u8(0)?;
            enc.write_dims(dims)?;
            enc.write_i32(fields.len() as i32)?;
            for field in fields {
                enc.write_cstr(field)?;
            }
            for cell in cells {
                encode_array(enc, cell)?;
            }
        }
    }
    Ok(())
}

fn decode_array(dec: &mut Decoder) -> Result<Array, MetError> {
    let class_id = dec.read_u8()?;
    let complex = dec.read_u8()? != 0;
    let dims = dec.read_dims()?;
    let nelem: usize = dims.iter().product();

    Ok(match class_id {
        CLASS_LOGICAL => Array::Logical {
            bytes: dec.read_bytes(nelem)?,
            dims,
        },
        CLASS_CHAR => Array::Char {
            bytes: dec.read_bytes(nelem)?,
            dims,
        },
        CLASS_CELL => {
            let mut children = Vec::with_capacity(nelem);
            for _ in 0..nelem {
                children.push(decode_array(dec)?);
            }
            Array::Cell { dims, children }
        }
        CLASS_STRUCT => {
            let num_fields = dec.read_i32()?;
            if num_fields < 0 {
                return Err(MetError::Intrn);
            }
            let num_fields = num_fields as usize;
            let mut fields = Vec::with_capacity(num_fields);
            for _ in 0..num_fields {
                fields.push(dec.read_cstr()?);
            }
            let mut cells = Vec::with_capacity(nelem * num_fields);
            for _ in 0..(nelem * num_fields) {
                cells.push(decode_array(dec)?);
            }
            Array::Struct {
                dims,
                fields,
                cells,
            }
        }
        other => {
            let class = NumericClass::from_class_id(other).ok_or(MetError::Pbsig)?;
            let elem_size = class.elem_size();
            let real = dec.read_bytes(nelem * elem_size)?;
            let imag = if complex {
                Some(dec.read_bytes(nelem * elem_size)?)
            } else {
                None
            };
            Array::Numeric {
                class,
                dims,
                real,
                imag,
            }
        }
    })
}

/// Encode `arrays` into `buf`, which must begin with the [`HEADER_SIZE`]-byte
/// header region followed by the slot's array-stream capacity. Returns the
/// `bytes_used` value written into the header.
pub fn encode_slot(buf: &mut [u8], arrays: &[Array]) -> Result<usize, MetError> {
    if buf.len() < HEADER_SIZE {
        return Err(MetError::Intrn);
    }
    let (header, stream) = buf.split_at_mut(HEADER_SIZE);
    let mut enc = Encoder::new(stream);
    for array in arrays {
        encode_array(&mut enc, array)?;
    }
    let bytes_used = enc.pos;
    encode_header(header, bytes_used, arrays.len());
    Ok(bytes_used)
}

/// Decode the arrays described by `buf`'s header, verifying that decoding
/// consumes exactly `bytes_used` bytes (spec §8's testable property).
pub fn decode_slot(buf: &[u8]) -> Result<Vec<Array>, MetError> {
    if buf.len() < HEADER_SIZE {
        return Err(MetError::Intrn);
    }
    let (header, stream) = buf.split_at(HEADER_SIZE);
    let (bytes_used, num_arrays) = decode_header(header);
    if bytes_used > stream.len() {
        return Err(MetError::Intrn);
    }
    let mut dec = Decoder::new(&stream[..bytes_used]);
    let mut arrays = Vec::with_capacity(num_arrays);
    for _ in 0..num_arrays {
        arrays.push(decode_array(&mut dec)?);
    }
    if dec.pos != bytes_used {
        return Err(MetError::Intrn);
    }
    Ok(arrays)
}
