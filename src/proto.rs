//! Operation/response codes and the higher-level structures parsed out of
//! command response data (`DeviceInfo`, `ObjectInfo`). Grounded on the
//! opcode-enum style the teacher repo uses for its own vendor command sets.

use bytes::Buf;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::ToPrimitive;

use crate::codec::FramingError;
use crate::wire::{read_ptp_array_u16, read_ptp_string};

pub const RESPONSE_OK: u16 = 0x2001;

#[repr(u16)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, FromPrimitive, ToPrimitive)]
pub enum OperationCode {
    GetDeviceInfo = 0x1001,
    OpenSession = 0x1002,
    CloseSession = 0x1003,
    GetObjectInfo = 0x1008,
    GetObject = 0x1009,
    GetDevicePropDesc = 0x1014,
    GetPartialObject = 0x101B,

    // Canon
    CanonSetEventMode = 0x9115,
    CanonGetEvent = 0x9116,

    // Sony
    SonySdioConnect = 0x9201,
    SonyGetDevicePropDesc = 0x9203,
    SonyGetAllDevicePropData = 0x9209,
    SonyVendorHandshake = 0x920D,

    // Nikon
    NikonGetEvents = 0x90C7,
}

impl OperationCode {
    pub fn code(self) -> u16 {
        self.to_u16().expect("OperationCode always fits u16")
    }
}

#[repr(u16)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, FromPrimitive, ToPrimitive)]
pub enum SonyPropertyCode {
    ObjectInMemory = 0xD215,
}

/// `{opcode, transaction_id, params: [u32; 0..=5]}`. The transaction id is
/// allocated by the caller (see [`crate::session::transaction`]); this type
/// is the shape, not the allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBlock {
    pub opcode: u16,
    pub transaction_id: u32,
    pub params: Vec<u32>,
}

impl CommandBlock {
    pub fn new(opcode: u16, transaction_id: u32, params: impl Into<Vec<u32>>) -> Self {
        let params = params.into();
        debug_assert!(params.len() <= 5, "PTP commands carry at most 5 params");
        Self {
            opcode,
            transaction_id,
            params,
        }
    }
}

/// `{code, transaction_id, params: [u32; 0..=5]}`. `code == 0x2001` is OK;
/// any other value is an error code the caller must surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseBlock {
    pub code: u16,
    pub transaction_id: u32,
    pub params: Vec<u32>,
}

impl ResponseBlock {
    pub fn is_ok(&self) -> bool {
        self.code == RESPONSE_OK
    }
}

/// Parsed from `GetDeviceInfo(0x1001)` response data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub vendor_extension_id: u32,
    pub vendor_extension_version: u16,
    pub functional_mode: u16,
    pub manufacturer: String,
    pub model: String,
    pub device_version: String,
    pub serial_number: String,
    pub supported_operations: Vec<u16>,
    pub supported_events: Vec<u16>,
    pub supported_properties: Vec<u16>,
}

impl DeviceInfo {
    pub fn parse(data: &[u8]) -> Result<Self, FramingError> {
        let mut buf = data;
        if buf.remaining() < 2 {
            return Err(FramingError::ShortFrame);
        }
        let _standard_version = buf.get_u16_le();
        if buf.remaining() < 4 {
            return Err(FramingError::ShortFrame);
        }
        let vendor_extension_id = buf.get_u32_le();
        if buf.remaining() < 2 {
            return Err(FramingError::ShortFrame);
        }
        let vendor_extension_version = buf.get_u16_le();
        let _vendor_extension_desc = read_ptp_string(&mut buf)?;
        if buf.remaining() < 2 {
            return Err(FramingError::ShortFrame);
        }
        let functional_mode = buf.get_u16_le();
        let supported_operations = read_ptp_array_u16(&mut buf)?;
        let supported_events = read_ptp_array_u16(&mut buf)?;
        let supported_properties = read_ptp_array_u16(&mut buf)?;
        let _capture_formats = read_ptp_array_u16(&mut buf)?;
        let _image_formats = read_ptp_array_u16(&mut buf)?;
        let manufacturer = read_ptp_string(&mut buf)?;
        let model = read_ptp_string(&mut buf)?;
        let device_version = read_ptp_string(&mut buf)?;
        let serial_number = read_ptp_string(&mut buf)?;

        Ok(DeviceInfo {
            vendor_extension_id,
            vendor_extension_version,
            functional_mode,
            manufacturer,
            model,
            device_version,
            serial_number,
            supported_operations,
            supported_events,
            supported_properties,
        })
    }
}

/// The standard PTP object format code for EXIF/JPEG stills. Every
/// consumer camera in scope reports this for ordinary JPEG captures.
pub const FORMAT_EXIF_JPEG: u16 = 0x3801;

/// Format codes that classify an object as RAW. The ISO 15740 image-format
/// range (0x3000-0x3FFF) is mostly non-RAW container formats (JPEG, TIFF,
/// PNG, ...); `FORMAT_EXIF_JPEG` is explicitly excluded so ordinary JPEG
/// captures are never treated as RAW. Vendor-specific RAW formats (Canon
/// CR2/CR3, Nikon NEF, Sony ARW) additionally live in the 0xB000-0xBFFF
/// vendor-extension range and are always RAW.
pub fn is_raw_format(format_code: u16) -> bool {
    (format_code != FORMAT_EXIF_JPEG && (0x3000..=0x3FFF).contains(&format_code))
        || (0xB000..=0xBFFF).contains(&format_code)
}

/// Parsed from `GetObjectInfo(0x1008)` response data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub storage_id: u32,
    pub object_format: u16,
    pub protection_status: u16,
    pub object_compressed_size: u64,
    pub thumb_format: u16,
    pub thumb_compressed_size: u32,
    pub parent_object: u32,
    pub association_type: u16,
    pub filename: String,
    pub capture_date: String,
    pub modification_date: String,
}

impl ObjectInfo {
    pub fn parse(data: &[u8]) -> Result<Self, FramingError> {
        let mut buf = data;
        if buf.remaining() < 20 {
            return Err(FramingError::ShortFrame);
        }
        let storage_id = buf.get_u32_le();
        let object_format = buf.get_u16_le();
        let protection_status = buf.get_u16_le();
        let object_compressed_size = buf.get_u32_le() as u64;
        let thumb_format = buf.get_u16_le();
        let thumb_compressed_size = buf.get_u32_le();
        let _thumb_pix_width = buf.get_u32_le();
        let _thumb_pix_height = buf.get_u32_le();
        if buf.remaining() < 20 {
            return Err(FramingError::ShortFrame);
        }
        let _image_pix_width = buf.get_u32_le();
        let _image_pix_height = buf.get_u32_le();
        let _image_bit_depth = buf.get_u32_le();
        let parent_object = buf.get_u32_le();
        let association_type = buf.get_u16_le();
        if buf.remaining() < 4 {
            return Err(FramingError::ShortFrame);
        }
        let _association_desc = buf.get_u32_le();
        if buf.remaining() < 4 {
            return Err(FramingError::ShortFrame);
        }
        let _sequence_number = buf.get_u32_le();
        let filename = read_ptp_string(&mut buf)?;
        let capture_date = read_ptp_string(&mut buf)?;
        let modification_date = read_ptp_string(&mut buf)?;
        let _keywords = read_ptp_string(&mut buf)?;

        Ok(ObjectInfo {
            storage_id,
            object_format,
            protection_status,
            object_compressed_size,
            thumb_format,
            thumb_compressed_size,
            parent_object,
            association_type,
            filename,
            capture_date,
            modification_date,
        })
    }

    /// Sony in-memory transfers report a 32-bit size of `0xFFFFFFFF` when
    /// the true size only fits in the vendor's 64-bit extension op;
    /// callers needing the exact size for in-memory captures should use
    /// `Sony_GetAllDevicePropData` instead of trusting this field blindly.
    pub fn is_raw(&self) -> bool {
        is_raw_format(self.object_format)
    }

    /// Parses `capture_date` (PTP's `YYYYMMDDThhmmss[.s]` form, optionally
    /// followed by a UTC offset) into a local timestamp. `None` if the
    /// camera reported an empty or malformed string, which some Sony bodies
    /// do for in-memory captures before the file is flushed to card.
    pub fn capture_timestamp(&self) -> Option<chrono::NaiveDateTime> {
        parse_ptp_datetime(&self.capture_date)
    }
}

/// Parses a PTP datetime string. The format is `YYYYMMDDThhmmss`, with an
/// optional `.s` fractional-second suffix and an optional trailing UTC
/// offset (`+hhmm`/`-hhmm`) that this client discards, since every vendor in
/// scope reports it in the camera's local time.
fn parse_ptp_datetime(s: &str) -> Option<chrono::NaiveDateTime> {
    let core = s.split(['.', '+', '-']).next()?;
    chrono::NaiveDateTime::parse_from_str(core, "%Y%m%dT%H%M%S").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};
    use crate::wire::write_ptp_string;

    fn sample_device_info_bytes() -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u16_le(100); // standard version
        buf.put_u32_le(0x0000_0006); // vendor extension id (canon)
        buf.put_u16_le(100); // vendor extension version
        write_ptp_string(&mut buf, ""); // vendor extension desc
        buf.put_u16_le(0); // functional mode
        crate::wire::write_ptp_array_u16(&mut buf, &[0x1001, 0x1008, 0x9116]);
        crate::wire::write_ptp_array_u16(&mut buf, &[0x4002]);
        crate::wire::write_ptp_array_u16(&mut buf, &[0xD000]);
        crate::wire::write_ptp_array_u16(&mut buf, &[]); // capture formats
        crate::wire::write_ptp_array_u16(&mut buf, &[0x3801]); // image formats
        write_ptp_string(&mut buf, "Canon Inc.");
        write_ptp_string(&mut buf, "Canon EOS R5");
        write_ptp_string(&mut buf, "3-1-2");
        write_ptp_string(&mut buf, "000123456789");
        buf.to_vec()
    }

    #[test]
    fn parses_device_info() {
        let bytes = sample_device_info_bytes();
        let info = DeviceInfo::parse(&bytes).unwrap();
        assert_eq!(info.manufacturer, "Canon Inc.");
        assert_eq!(info.model, "Canon EOS R5");
        assert_eq!(info.supported_operations, vec![0x1001, 0x1008, 0x9116]);
        assert_eq!(info.supported_events, vec![0x4002]);
    }

    fn sample_object_info_bytes(filename: &str, format: u16, size: u32) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u32_le(0x0001_0001); // storage id
        buf.put_u16_le(format);
        buf.put_u16_le(0); // protection status
        buf.put_u32_le(size);
        buf.put_u16_le(0); // thumb format
        buf.put_u32_le(0); // thumb compressed size
        buf.put_u32_le(0); // thumb pix width
        buf.put_u32_le(0); // thumb pix height
        buf.put_u32_le(0); // image pix width
        buf.put_u32_le(0); // image pix height
        buf.put_u32_le(0); // image bit depth
        buf.put_u32_le(0); // parent object
        buf.put_u16_le(0); // association type
        buf.put_u32_le(0); // association desc
        buf.put_u32_le(0); // sequence number
        write_ptp_string(&mut buf, filename);
        write_ptp_string(&mut buf, "20260101T120000");
        write_ptp_string(&mut buf, "20260101T120000");
        write_ptp_string(&mut buf, "");
        buf.to_vec()
    }

    #[test]
    fn parses_object_info_and_classifies_raw() {
        let bytes = sample_object_info_bytes("IMG_0001.JPG", 0x3801, 3_200_000);
        let info = ObjectInfo::parse(&bytes).unwrap();
        assert_eq!(info.filename, "IMG_0001.JPG");
        assert_eq!(info.object_compressed_size, 3_200_000);
        assert!(!info.is_raw());

        let bytes = sample_object_info_bytes("IMG_0002.CR2", 0x3800, 20_000_000);
        let info = ObjectInfo::parse(&bytes).unwrap();
        assert!(info.is_raw());
    }

    #[test]
    fn capture_timestamp_parses_ptp_datetime() {
        let bytes = sample_object_info_bytes("IMG_0003.JPG", 0x3801, 1);
        let info = ObjectInfo::parse(&bytes).unwrap();
        let ts = info.capture_timestamp().expect("valid PTP datetime");
        assert_eq!(ts.to_string(), "2026-01-01 12:00:00");
    }

    #[test]
    fn capture_timestamp_none_for_empty_string() {
        assert_eq!(parse_ptp_datetime(""), None);
    }
}
