//! macOS H.264 engine using VideoToolbox

use super::super::{CompressionEngine, CompressionProperties, EncodedSample, Frame, MediaTime};
use super::super::{ParameterSets, SessionConfig};
use crate::session::Dispatcher;
use crate::{Error, Result};
use std::ffi::c_void;
use std::ptr;
use std::slice;

type OSStatus = i32;
type CFTypeRef = *const c_void;
type CFStringRef = *const c_void;

#[repr(C)]
struct CFArrayCallBacks {
    _private: [u8; 0],
}

type CompressionOutputCallback = extern "C" fn(*mut c_void, *mut c_void, OSStatus, u32, *mut c_void);

// CoreFoundation FFI bindings
#[link(name = "CoreFoundation", kind = "framework")]
extern "C" {
    static kCFBooleanFalse: CFTypeRef;
    static kCFTypeArrayCallBacks: CFArrayCallBacks;

    fn CFNumberCreate(allocator: *const c_void, the_type: isize, value_ptr: *const c_void)
        -> CFTypeRef;
    fn CFArrayCreate(
        allocator: *const c_void,
        values: *const CFTypeRef,
        num_values: isize,
        callbacks: *const CFArrayCallBacks,
    ) -> CFTypeRef;
    fn CFArrayGetCount(array: CFTypeRef) -> isize;
    fn CFArrayGetValueAtIndex(array: CFTypeRef, index: isize) -> CFTypeRef;
    fn CFDictionaryGetValue(dict: CFTypeRef, key: CFTypeRef) -> CFTypeRef;
    fn CFBooleanGetValue(boolean: CFTypeRef) -> u8;
    fn CFRelease(cf: CFTypeRef);
}

// VideoToolbox FFI bindings
#[link(name = "VideoToolbox", kind = "framework")]
extern "C" {
    static kVTCompressionPropertyKey_MaxKeyFrameInterval: CFStringRef;
    static kVTCompressionPropertyKey_MaxKeyFrameIntervalDuration: CFStringRef;
    static kVTCompressionPropertyKey_ExpectedFrameRate: CFStringRef;
    static kVTCompressionPropertyKey_AverageBitRate: CFStringRef;
    static kVTCompressionPropertyKey_DataRateLimits: CFStringRef;
    static kVTCompressionPropertyKey_AllowFrameReordering: CFStringRef;

    fn VTCompressionSessionCreate(
        allocator: *const c_void,
        width: i32,
        height: i32,
        codec_type: u32,
        encoder_specification: *const c_void,
        source_image_buffer_attributes: *const c_void,
        compressed_data_allocator: *const c_void,
        output_callback: CompressionOutputCallback,
        output_callback_ref_con: *mut c_void,
        compression_session_out: *mut *mut c_void,
    ) -> OSStatus;

    fn VTSessionSetProperty(session: *mut c_void, key: CFStringRef, value: CFTypeRef) -> OSStatus;

    fn VTCompressionSessionPrepareToEncodeFrames(session: *mut c_void) -> OSStatus;

    fn VTCompressionSessionEncodeFrame(
        session: *mut c_void,
        image_buffer: *mut c_void,
        presentation_timestamp: CMTime,
        duration: CMTime,
        frame_properties: *const c_void,
        source_frame_ref_con: *mut c_void,
        info_flags_out: *mut u32,
    ) -> OSStatus;

    fn VTCompressionSessionCompleteFrames(
        session: *mut c_void,
        complete_until_presentation_timestamp: CMTime,
    ) -> OSStatus;

    fn VTCompressionSessionInvalidate(session: *mut c_void);
}

#[link(name = "CoreMedia", kind = "framework")]
extern "C" {
    static kCMSampleAttachmentKey_NotSync: CFStringRef;

    fn CMTimeMake(value: i64, timescale: i32) -> CMTime;
    fn CMSampleBufferGetSampleAttachmentsArray(
        sample_buffer: *mut c_void,
        create_if_necessary: u8,
    ) -> CFTypeRef;
    fn CMSampleBufferGetFormatDescription(sample_buffer: *mut c_void) -> *const c_void;
    fn CMSampleBufferGetDataBuffer(sample_buffer: *mut c_void) -> *const c_void;
    fn CMSampleBufferGetPresentationTimeStamp(sample_buffer: *mut c_void) -> CMTime;
    fn CMVideoFormatDescriptionGetH264ParameterSetAtIndex(
        video_desc: *const c_void,
        parameter_set_index: usize,
        parameter_set_pointer_out: *mut *const u8,
        parameter_set_size_out: *mut usize,
        parameter_set_count_out: *mut usize,
        nal_unit_header_length_out: *mut i32,
    ) -> OSStatus;
    fn CMBlockBufferGetDataLength(buffer: *const c_void) -> usize;
    fn CMBlockBufferCopyDataBytes(
        buffer: *const c_void,
        offset_to_data: usize,
        data_length: usize,
        destination: *mut c_void,
    ) -> OSStatus;
}

#[link(name = "CoreVideo", kind = "framework")]
extern "C" {
    fn CVPixelBufferCreate(
        allocator: *const c_void,
        width: usize,
        height: usize,
        pixel_format_type: u32,
        pixel_buffer_attributes: *const c_void,
        pixel_buffer_out: *mut *mut c_void,
    ) -> i32;

    fn CVPixelBufferLockBaseAddress(pixel_buffer: *mut c_void, lock_flags: u64) -> i32;
    fn CVPixelBufferUnlockBaseAddress(pixel_buffer: *mut c_void, unlock_flags: u64) -> i32;
    fn CVPixelBufferGetBaseAddress(pixel_buffer: *mut c_void) -> *mut u8;
    fn CVPixelBufferGetBytesPerRow(pixel_buffer: *mut c_void) -> usize;
    fn CVPixelBufferRelease(pixel_buffer: *mut c_void);
}

#[repr(C)]
#[derive(Clone, Copy)]
struct CMTime {
    value: i64,
    timescale: i32,
    flags: u32,
    epoch: i64,
}

const K_CM_TIME_FLAGS_VALID: u32 = 1;
const K_CM_TIME_INVALID: CMTime = CMTime {
    value: 0,
    timescale: 0,
    flags: 0,
    epoch: 0,
};
const K_CF_NUMBER_SINT32_TYPE: isize = 3;
const K_CF_NUMBER_SINT64_TYPE: isize = 4;
const K_CV_PIXEL_FORMAT_TYPE_32_BGRA: u32 = 0x42475241; // 'BGRA'
const K_CMV_VIDEO_CODEC_TYPE_H264: u32 = 0x61766331; // 'avc1'
const K_VT_ENCODE_INFO_FRAME_DROPPED: u32 = 1 << 1;

/// Owned CoreFoundation object, released on drop
struct CfOwned(CFTypeRef);

impl CfOwned {
    fn number_i32(value: i32) -> Result<Self> {
        let number = unsafe {
            CFNumberCreate(
                ptr::null(),
                K_CF_NUMBER_SINT32_TYPE,
                &value as *const i32 as *const c_void,
            )
        };
        Self::checked(number, "CFNumberCreate")
    }

    fn number_i64(value: i64) -> Result<Self> {
        let number = unsafe {
            CFNumberCreate(
                ptr::null(),
                K_CF_NUMBER_SINT64_TYPE,
                &value as *const i64 as *const c_void,
            )
        };
        Self::checked(number, "CFNumberCreate")
    }

    fn array(values: &[&CfOwned]) -> Result<Self> {
        let raw: Vec<CFTypeRef> = values.iter().map(|value| value.0).collect();
        let array = unsafe {
            CFArrayCreate(
                ptr::null(),
                raw.as_ptr(),
                raw.len() as isize,
                &kCFTypeArrayCallBacks,
            )
        };
        Self::checked(array, "CFArrayCreate")
    }

    fn checked(object: CFTypeRef, what: &str) -> Result<Self> {
        if object.is_null() {
            return Err(Error::Platform(format!("{} returned null", what)));
        }
        Ok(Self(object))
    }
}

impl Drop for CfOwned {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { CFRelease(self.0) };
        }
    }
}

/// Owned CVPixelBuffer, released on drop
struct PixelBuffer(*mut c_void);

impl PixelBuffer {
    /// Allocate a BGRA buffer and fill it from an RGBA frame
    fn from_frame(frame: &Frame) -> Result<Self> {
        let mut raw: *mut c_void = ptr::null_mut();

        let status = unsafe {
            CVPixelBufferCreate(
                ptr::null(),
                frame.width() as usize,
                frame.height() as usize,
                K_CV_PIXEL_FORMAT_TYPE_32_BGRA,
                ptr::null(),
                &mut raw,
            )
        };

        if status != 0 || raw.is_null() {
            return Err(Error::Encode(format!(
                "Failed to create pixel buffer: {}",
                status
            )));
        }
        let buffer = Self(raw);

        let status = unsafe { CVPixelBufferLockBaseAddress(buffer.0, 0) };
        if status != 0 {
            return Err(Error::Encode(format!(
                "Failed to lock pixel buffer: {}",
                status
            )));
        }

        unsafe {
            let base_address = CVPixelBufferGetBaseAddress(buffer.0);
            let bytes_per_row = CVPixelBufferGetBytesPerRow(buffer.0);
            let width = frame.width() as usize;
            let src = frame.data();

            // Convert RGBA to BGRA row by row
            for y in 0..frame.height() as usize {
                let src_row = &src[y * width * 4..(y + 1) * width * 4];
                let dst_row = slice::from_raw_parts_mut(base_address.add(y * bytes_per_row), width * 4);
                for (dst, px) in dst_row.chunks_exact_mut(4).zip(src_row.chunks_exact(4)) {
                    dst[0] = px[2];
                    dst[1] = px[1];
                    dst[2] = px[0];
                    dst[3] = px[3];
                }
            }

            CVPixelBufferUnlockBaseAddress(buffer.0, 0);
        }

        Ok(buffer)
    }
}

impl Drop for PixelBuffer {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { CVPixelBufferRelease(self.0) };
        }
    }
}

/// VideoToolbox H.264 engine
pub struct VideoToolboxEngine {
    session: *mut c_void,
    // Refcon target of the output callback; outlives the session
    dispatcher: Box<Dispatcher>,
    config: SessionConfig,
}

// The session may be driven from any thread; output arrives on
// VideoToolbox's own threads and only touches the boxed dispatcher.
unsafe impl Send for VideoToolboxEngine {}

impl VideoToolboxEngine {
    pub fn new(config: &SessionConfig, dispatcher: Dispatcher) -> Result<Self> {
        let dispatcher = Box::new(dispatcher);
        let refcon = &*dispatcher as *const Dispatcher as *mut c_void;

        let mut session: *mut c_void = ptr::null_mut();

        let status = unsafe {
            VTCompressionSessionCreate(
                ptr::null(),
                config.width as i32,
                config.height as i32,
                K_CMV_VIDEO_CODEC_TYPE_H264,
                ptr::null(),
                ptr::null(),
                ptr::null(),
                compression_output_callback,
                refcon,
                &mut session,
            )
        };

        if status != 0 || session.is_null() {
            return Err(Error::SessionInit(format!(
                "Failed to create VideoToolbox session: {}",
                status
            )));
        }

        Ok(Self {
            session,
            dispatcher,
            config: config.clone(),
        })
    }

    fn set_property(&self, key: CFStringRef, value: CFTypeRef) -> Result<()> {
        let status = unsafe { VTSessionSetProperty(self.session, key, value) };
        if status != 0 {
            return Err(Error::SessionInit(format!(
                "VTSessionSetProperty failed: {}",
                status
            )));
        }
        Ok(())
    }

    fn live_session(&self) -> Result<*mut c_void> {
        if self.session.is_null() {
            return Err(Error::Encode("Session invalidated".to_string()));
        }
        Ok(self.session)
    }
}

impl CompressionEngine for VideoToolboxEngine {
    fn configure(&mut self, properties: &CompressionProperties) -> Result<()> {
        self.live_session()?;

        let keyframe_interval = CfOwned::number_i32(properties.max_keyframe_interval as i32)?;
        let keyframe_duration =
            CfOwned::number_i32(properties.max_keyframe_interval_duration as i32)?;
        let frame_rate = CfOwned::number_i32(properties.expected_frame_rate as i32)?;
        let average = CfOwned::number_i64(properties.average_bit_rate as i64)?;

        // DataRateLimits is [bytes, seconds]
        let limit_bytes = CfOwned::number_i64((properties.data_rate_limit / 8) as i64)?;
        let limit_window = CfOwned::number_i32(1)?;
        let limits = CfOwned::array(&[&limit_bytes, &limit_window])?;

        unsafe {
            self.set_property(kVTCompressionPropertyKey_MaxKeyFrameInterval, keyframe_interval.0)?;
            self.set_property(
                kVTCompressionPropertyKey_MaxKeyFrameIntervalDuration,
                keyframe_duration.0,
            )?;
            self.set_property(kVTCompressionPropertyKey_ExpectedFrameRate, frame_rate.0)?;
            self.set_property(kVTCompressionPropertyKey_AverageBitRate, average.0)?;
            self.set_property(kVTCompressionPropertyKey_DataRateLimits, limits.0)?;
            if !properties.allow_frame_reordering {
                self.set_property(
                    kVTCompressionPropertyKey_AllowFrameReordering,
                    kCFBooleanFalse,
                )?;
            }
        }

        let status = unsafe { VTCompressionSessionPrepareToEncodeFrames(self.session) };
        if status != 0 {
            return Err(Error::SessionInit(format!(
                "Failed to prepare VideoToolbox session: {}",
                status
            )));
        }

        log::debug!(
            "VideoToolbox session {} ready for {}x{}",
            self.dispatcher.handle(),
            self.config.width,
            self.config.height
        );
        Ok(())
    }

    fn encode(&mut self, frame: &Frame, pts: MediaTime) -> Result<()> {
        let session = self.live_session()?;
        let pixel_buffer = PixelBuffer::from_frame(frame)?;

        let presentation = unsafe { CMTimeMake(pts.value, pts.timescale) };
        let duration = unsafe { CMTimeMake(1, pts.timescale) };
        let mut info_flags: u32 = 0;

        let status = unsafe {
            VTCompressionSessionEncodeFrame(
                session,
                pixel_buffer.0,
                presentation,
                duration,
                ptr::null(),
                ptr::null_mut(),
                &mut info_flags,
            )
        };

        if status != 0 {
            return Err(Error::Encode(format!("Failed to encode frame: {}", status)));
        }
        Ok(())
    }

    fn complete_frames(&mut self) -> Result<()> {
        if self.session.is_null() {
            return Ok(());
        }

        // Returns once every pending callback has run
        let status = unsafe { VTCompressionSessionCompleteFrames(self.session, K_CM_TIME_INVALID) };
        if status != 0 {
            return Err(Error::Encode(format!(
                "Failed to complete frames: {}",
                status
            )));
        }
        Ok(())
    }

    fn invalidate(&mut self) {
        if self.session.is_null() {
            return;
        }
        unsafe {
            VTCompressionSessionInvalidate(self.session);
            CFRelease(self.session as CFTypeRef);
        }
        self.session = ptr::null_mut();
    }

    fn name(&self) -> &'static str {
        "videotoolbox"
    }
}

impl Drop for VideoToolboxEngine {
    fn drop(&mut self) {
        // Must run before the boxed dispatcher is freed
        self.invalidate();
    }
}

extern "C" fn compression_output_callback(
    output_callback_ref_con: *mut c_void,
    _source_frame_ref_con: *mut c_void,
    status: OSStatus,
    info_flags: u32,
    sample_buffer: *mut c_void,
) {
    if output_callback_ref_con.is_null() {
        return;
    }
    let dispatcher = unsafe { &*(output_callback_ref_con as *const Dispatcher) };

    if status != 0 {
        dispatcher.deliver(Err(Error::Encode(format!(
            "VideoToolbox reported status {}",
            status
        ))));
        return;
    }

    if sample_buffer.is_null() || info_flags & K_VT_ENCODE_INFO_FRAME_DROPPED != 0 {
        log::debug!("VideoToolbox dropped a frame in session {}", dispatcher.handle());
        return;
    }

    dispatcher.deliver(unsafe { read_sample(sample_buffer) });
}

unsafe fn read_sample(sample_buffer: *mut c_void) -> Result<EncodedSample> {
    let keyframe = is_keyframe(sample_buffer);

    let parameter_sets = if keyframe {
        Some(read_parameter_sets(CMSampleBufferGetFormatDescription(
            sample_buffer,
        ))?)
    } else {
        None
    };

    let block = CMSampleBufferGetDataBuffer(sample_buffer);
    if block.is_null() {
        return Err(Error::Encode("Sample buffer has no data".to_string()));
    }

    let length = CMBlockBufferGetDataLength(block);
    let mut data = vec![0u8; length];
    let status = CMBlockBufferCopyDataBytes(block, 0, length, data.as_mut_ptr() as *mut c_void);
    if status != 0 {
        return Err(Error::Encode(format!(
            "Failed to copy sample data: {}",
            status
        )));
    }

    let time = CMSampleBufferGetPresentationTimeStamp(sample_buffer);
    let pts = (time.flags & K_CM_TIME_FLAGS_VALID != 0)
        .then(|| MediaTime::new(time.value, time.timescale));

    Ok(EncodedSample {
        keyframe,
        data,
        parameter_sets,
        pts,
    })
}

/// A sample is a keyframe unless its first attachment says NotSync
unsafe fn is_keyframe(sample_buffer: *mut c_void) -> bool {
    let attachments = CMSampleBufferGetSampleAttachmentsArray(sample_buffer, 0);
    if attachments.is_null() || CFArrayGetCount(attachments) == 0 {
        return true;
    }

    let attachment = CFArrayGetValueAtIndex(attachments, 0);
    if attachment.is_null() {
        return true;
    }

    let not_sync = CFDictionaryGetValue(attachment, kCMSampleAttachmentKey_NotSync);
    not_sync.is_null() || CFBooleanGetValue(not_sync) == 0
}

unsafe fn read_parameter_sets(format: *const c_void) -> Result<ParameterSets> {
    if format.is_null() {
        return Err(Error::Encode("Keyframe has no format description".to_string()));
    }

    Ok(ParameterSets {
        sps: read_parameter_set(format, 0)?,
        pps: read_parameter_set(format, 1)?,
    })
}

unsafe fn read_parameter_set(format: *const c_void, index: usize) -> Result<Vec<u8>> {
    let mut pointer: *const u8 = ptr::null();
    let mut size: usize = 0;
    let mut count: usize = 0;
    let mut header_length: i32 = 0;

    let status = CMVideoFormatDescriptionGetH264ParameterSetAtIndex(
        format,
        index,
        &mut pointer,
        &mut size,
        &mut count,
        &mut header_length,
    );

    if status != 0 || pointer.is_null() {
        return Err(Error::Encode(format!(
            "Failed to read parameter set {}: {}",
            index, status
        )));
    }

    Ok(slice::from_raw_parts(pointer, size).to_vec())
}

/// Check if VideoToolbox is available
pub fn check_available() -> Result<()> {
    // VideoToolbox is always available on macOS 10.8+
    Ok(())
}
