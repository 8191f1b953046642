//! Frame decoding over synthetic DICOM files.

mod common;

use std::io::Cursor;

use common::{dicom_file, native_pixel_data_offset, temp_file, DataSet, Encoding, Image};
use dicom_dictionary_std::{tags, uids};
use dicom_pixelcore::codec::CodecError;
use dicom_pixelcore::{
    CodecRegistry, DecoderContext, DicomPixelGeometry, Error, FrameData, GeometryParser,
    PixelLayout, PixelSource, Raster, RasterData, ReadParams,
};

fn frame_pattern(frame: usize, len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + frame * 31) as u8).collect()
}

fn source_from(bytes: Vec<u8>) -> PixelSource<Cursor<Vec<u8>>> {
    PixelSource::from_reader(Cursor::new(bytes), &GeometryParser::default()).unwrap()
}

/// A codec which returns the frame bytes as a single row of 8-bit samples.
fn identity_codec(data: &[u8], _: &DicomPixelGeometry) -> Result<Raster, CodecError> {
    Raster::new(data.len() as u32, 1, 1, RasterData::U8(data.to_vec()))
        .map_err(|e| CodecError::with_source("bad frame", e))
}

#[test]
fn three_frame_native_reads_exact_range() {
    let frame_len = 256 * 256;
    let pixels: Vec<u8> = (0..3).flat_map(|f| frame_pattern(f, frame_len)).collect();
    let mut ds = DataSet::new(Encoding::ExplicitLittle);
    ds.image(&Image::monochrome(256, 256, 8).frames(3))
        .native_pixel_data(b"OB", &pixels);
    let bytes = dicom_file(uids::EXPLICIT_VR_LITTLE_ENDIAN, &ds);
    let offset = native_pixel_data_offset(&bytes, pixels.len());

    let file = temp_file(&bytes);
    let mut source = PixelSource::open(file.path()).unwrap();
    assert_eq!(source.frame_count(), 3);
    assert_eq!(source.geometry().pixel_data_offset, offset);

    let descriptor = source.frame_descriptor(2).unwrap();
    assert_eq!(
        descriptor.ranges,
        vec![offset + 2 * 65536..offset + 3 * 65536]
    );

    let context = DecoderContext::default();
    let frame = context
        .decode_frame(&mut source, 2, &ReadParams::default())
        .unwrap()
        .into_raster()
        .unwrap();
    assert_eq!((frame.width(), frame.height(), frame.channels()), (256, 256, 1));
    assert_eq!(frame.data(), &RasterData::U8(pixels[2 * 65536..].to_vec()));

    let raw = context.decode_frame_bytes(&mut source, 0).unwrap();
    assert_eq!(raw, pixels[..65536].to_vec());
    assert_eq!(source.number_of_fragments().unwrap(), 0);
}

#[test]
fn native_frame_offsets_are_arithmetic() {
    let frame_len = 512 * 512 * 2;
    let mut ds = DataSet::new(Encoding::ExplicitLittle);
    ds.image(&Image::monochrome(512, 512, 16).frames(10))
        .native_pixel_data(b"OW", &vec![0; frame_len * 10]);
    let bytes = dicom_file(uids::EXPLICIT_VR_LITTLE_ENDIAN, &ds);
    let offset = native_pixel_data_offset(&bytes, frame_len * 10);

    let mut source = source_from(bytes);
    assert_eq!(source.geometry().frame_len(), 524_288);
    let descriptor = source.frame_descriptor(5).unwrap();
    assert_eq!(descriptor.ranges[0].start, offset + 2_621_440);
    assert_eq!(descriptor.len(), 524_288);
}

#[test]
fn frame_index_out_of_range() {
    let mut ds = DataSet::new(Encoding::ExplicitLittle);
    ds.image(&Image::monochrome(2, 2, 8).frames(3))
        .native_pixel_data(b"OB", &[0; 12]);
    let mut source = source_from(dicom_file(uids::EXPLICIT_VR_LITTLE_ENDIAN, &ds));

    let err = DecoderContext::default()
        .decode_frame(&mut source, 3, &ReadParams::default())
        .unwrap_err();
    assert!(matches!(err, Error::FrameIndex { index: 3, count: 3 }));
}

#[test]
fn truncated_native_frame() {
    let mut ds = DataSet::new(Encoding::ExplicitLittle);
    ds.image(&Image::monochrome(4, 4, 8).frames(2));
    // value length promises two frames, only one and a half are there
    ds.bytes.extend_from_slice(&[0xE0, 0x7F, 0x10, 0x00]);
    ds.bytes.extend_from_slice(b"OB\0\0");
    ds.bytes.extend_from_slice(&32_u32.to_le_bytes());
    ds.bytes.extend_from_slice(&[1; 24]);
    let mut source = source_from(dicom_file(uids::EXPLICIT_VR_LITTLE_ENDIAN, &ds));

    let context = DecoderContext::default();
    assert!(context
        .decode_frame(&mut source, 0, &ReadParams::default())
        .is_ok());
    let err = context
        .decode_frame(&mut source, 1, &ReadParams::default())
        .unwrap_err();
    assert!(matches!(
        err,
        Error::TruncatedStream {
            index: 1,
            expected: 16
        }
    ));
}

#[test]
fn native_frames_end_with_the_pixel_data_value() {
    let mut ds = DataSet::new(Encoding::ExplicitLittle);
    ds.image(&Image::monochrome(4, 4, 8).frames(2))
        .native_pixel_data(b"OB", &[1; 16]);
    // trailing padding element, long enough to pass for the second frame
    ds.bytes.extend_from_slice(&[0xFC, 0xFF, 0xFC, 0xFF]);
    ds.bytes.extend_from_slice(b"OB\0\0");
    ds.bytes.extend_from_slice(&16_u32.to_le_bytes());
    ds.bytes.extend_from_slice(&[0; 16]);
    let mut source = source_from(dicom_file(uids::EXPLICIT_VR_LITTLE_ENDIAN, &ds));
    assert_eq!(source.geometry().pixel_data_length, 16);

    let context = DecoderContext::default();
    let first = context
        .decode_raster(&mut source, 0, &ReadParams::default())
        .unwrap();
    assert_eq!(first.data(), &RasterData::U8(vec![1; 16]));
    assert!(source.frame_descriptor(1).is_err());
    let err = context
        .decode_frame(&mut source, 1, &ReadParams::default())
        .unwrap_err();
    assert!(matches!(
        err,
        Error::TruncatedStream {
            index: 1,
            expected: 16
        }
    ));
}

#[test]
fn missing_rows_is_a_format_error() {
    let mut ds = DataSet::new(Encoding::ExplicitLittle);
    ds.put_us(tags::COLUMNS, &[4])
        .put_us(tags::BITS_ALLOCATED, &[8])
        .native_pixel_data(b"OB", &[0; 4]);
    let result = PixelSource::from_reader(
        Cursor::new(dicom_file(uids::EXPLICIT_VR_LITTLE_ENDIAN, &ds)),
        &GeometryParser::default(),
    );
    assert!(matches!(result, Err(Error::Format { .. })));
}

#[test]
fn implicit_little_endian_signed_samples_are_rectified() {
    let mut image = Image::monochrome(1, 3, 16);
    image.bits_stored = 12;
    image.high_bit = 11;
    image.signed = true;
    let mut ds = DataSet::new(Encoding::ImplicitLittle);
    ds.image(&image).native_pixel_data(
        b"OW",
        &[0x01, 0x08, 0x23, 0x01, 0xFF, 0x0F],
    );
    let bytes = dicom_file(uids::IMPLICIT_VR_LITTLE_ENDIAN, &ds);

    let context = DecoderContext::default();
    let mut source = source_from(bytes);
    assert!(source.geometry().is_signed());

    let rectified = context
        .decode_raster(&mut source, 0, &ReadParams::default())
        .unwrap();
    assert_eq!(
        rectified.data(),
        &RasterData::I16(vec![0x8010_u16 as i16, 0x1230, -16])
    );

    let params = ReadParams {
        rectify_signed: false,
        ..ReadParams::default()
    };
    let stored = context.decode_raster(&mut source, 0, &params).unwrap();
    assert_eq!(stored.data(), &RasterData::I16(vec![0x0801, 0x0123, 0x0FFF]));
}

#[test]
fn explicit_big_endian_16_bit_samples() {
    let mut ds = DataSet::new(Encoding::ExplicitBig);
    ds.image(&Image::monochrome(1, 2, 16))
        .native_pixel_data(b"OW", &[0x01, 0x02, 0xAB, 0xCD]);
    let mut source = source_from(dicom_file(Encoding::ExplicitBig.transfer_syntax(), &ds));
    assert!(source.geometry().big_endian);
    assert!(!source.geometry().swap_byte_order);

    let raster = DecoderContext::default()
        .decode_raster(&mut source, 0, &ReadParams::default())
        .unwrap();
    assert_eq!(raster.data(), &RasterData::U16(vec![0x0102, 0xABCD]));
}

#[test]
fn explicit_big_endian_8_bit_words_are_swapped() {
    let mut ds = DataSet::new(Encoding::ExplicitBig);
    ds.image(&Image::monochrome(2, 2, 8))
        .native_pixel_data(b"OW", &[2, 1, 4, 3]);
    let mut source = source_from(dicom_file(Encoding::ExplicitBig.transfer_syntax(), &ds));
    assert!(source.geometry().swap_byte_order);

    let context = DecoderContext::default();
    let raster = context
        .decode_raster(&mut source, 0, &ReadParams::default())
        .unwrap();
    assert_eq!(raster.data(), &RasterData::U8(vec![1, 2, 3, 4]));
    // the raw bytes are left as stored
    assert_eq!(
        context.decode_frame_bytes(&mut source, 0).unwrap(),
        vec![2, 1, 4, 3]
    );
}

#[test]
fn banded_rgb_frames_are_interleaved() {
    let image = Image {
        samples_per_pixel: 3,
        photometric: "RGB",
        planar: true,
        ..Image::monochrome(1, 2, 8)
    };
    let mut ds = DataSet::new(Encoding::ExplicitLittle);
    ds.image(&image)
        .native_pixel_data(b"OB", &[10, 11, 20, 21, 30, 31]);
    let mut source = source_from(dicom_file(uids::EXPLICIT_VR_LITTLE_ENDIAN, &ds));
    assert!(matches!(source.layout(), PixelLayout::Banded(_)));

    let raster = DecoderContext::default()
        .decode_raster(&mut source, 0, &ReadParams::default())
        .unwrap();
    assert_eq!(raster.channels(), 3);
    assert_eq!(raster.data(), &RasterData::U8(vec![10, 20, 30, 11, 21, 31]));
}

#[test]
fn ybr_422_frames_are_unpacked_or_kept_packed() {
    let image = Image {
        samples_per_pixel: 3,
        photometric: "YBR_FULL_422",
        ..Image::monochrome(2, 4, 8)
    };
    // two 2x1 blocks per row: Y Y Cb Cr
    let packed = vec![
        1, 2, 100, 200, 3, 4, 101, 201, //
        5, 6, 102, 202, 7, 8, 103, 203,
    ];
    let mut ds = DataSet::new(Encoding::ExplicitLittle);
    ds.image(&image).native_pixel_data(b"OB", &packed);
    let mut source = source_from(dicom_file(uids::EXPLICIT_VR_LITTLE_ENDIAN, &ds));
    assert!(matches!(source.layout(), PixelLayout::Subsampled(_)));

    let context = DecoderContext::default();
    let raster = context
        .decode_raster(&mut source, 0, &ReadParams::default())
        .unwrap();
    assert_eq!((raster.width(), raster.height(), raster.channels()), (4, 2, 3));
    assert_eq!(
        raster.data(),
        &RasterData::U8(vec![
            1, 100, 200, 2, 100, 200, 3, 101, 201, 4, 101, 201, //
            5, 102, 202, 6, 102, 202, 7, 103, 203, 8, 103, 203,
        ])
    );

    let params = ReadParams {
        keep_packed: true,
        ..ReadParams::default()
    };
    let frame = context.decode_frame(&mut source, 0, &params).unwrap();
    assert_eq!(frame, FrameData::Packed(packed));
}

#[test]
fn ybr_420_frames_with_odd_dimensions() {
    let image = Image {
        samples_per_pixel: 3,
        photometric: "YBR_PARTIAL_420",
        ..Image::monochrome(3, 3, 8)
    }
    .frames(3);
    // 2 blocks per chroma row, the last one padded, and a luma only row
    let frame = |f: u8| -> Vec<u8> {
        [
            1, 2, 101, 201, 3, 0, 102, 202, //
            4, 5, 6, //
            7, 8, 103, 203, 9, 0, 104, 204,
        ]
        .iter()
        .map(|v| v + f)
        .collect()
    };
    let mut pixels: Vec<u8> = (0..3).flat_map(frame).collect();
    pixels.push(0);
    let mut ds = DataSet::new(Encoding::ExplicitLittle);
    ds.image(&image).native_pixel_data(b"OB", &pixels);
    let bytes = dicom_file(uids::EXPLICIT_VR_LITTLE_ENDIAN, &ds);
    let offset = native_pixel_data_offset(&bytes, pixels.len());

    let mut source = source_from(bytes);
    match source.layout() {
        PixelLayout::Subsampled(layout) => assert_eq!(layout.packed_frame_len(), 19),
        layout => panic!("unexpected layout {:?}", layout),
    }
    let descriptor = source.frame_descriptor(2).unwrap();
    assert_eq!(descriptor.ranges, vec![offset + 38..offset + 57]);

    let context = DecoderContext::default();
    let raster = context
        .decode_raster(&mut source, 2, &ReadParams::default())
        .unwrap();
    assert_eq!((raster.width(), raster.height(), raster.channels()), (3, 3, 3));
    let expected: Vec<u8> = [
        1, 101, 201, 2, 101, 201, 3, 102, 202, //
        4, 101, 201, 5, 101, 201, 6, 102, 202, //
        7, 103, 203, 8, 103, 203, 9, 104, 204,
    ]
    .iter()
    .map(|v| v + 2)
    .collect();
    assert_eq!(raster.data(), &RasterData::U8(expected));

    let params = ReadParams {
        keep_packed: true,
        ..ReadParams::default()
    };
    let packed = context.decode_frame(&mut source, 2, &params).unwrap();
    assert_eq!(packed, FrameData::Packed(frame(2)));
}

#[test]
fn subsampled_data_needs_three_bands() {
    let image = Image {
        samples_per_pixel: 1,
        photometric: "YBR_FULL_422",
        ..Image::monochrome(1, 2, 8)
    };
    let mut ds = DataSet::new(Encoding::ExplicitLittle);
    ds.image(&image).native_pixel_data(b"OB", &[1, 2, 3, 4]);
    let mut source = source_from(dicom_file(uids::EXPLICIT_VR_LITTLE_ENDIAN, &ds));

    let err = DecoderContext::default()
        .decode_raster(&mut source, 0, &ReadParams::default())
        .unwrap_err();
    assert!(matches!(err, Error::InvalidBandCount { bands: 1 }));
}

#[test]
fn palette_color_frames_are_expanded() {
    let image = Image {
        photometric: "PALETTE COLOR",
        ..Image::monochrome(2, 2, 8)
    };
    let mut ds = DataSet::new(Encoding::ExplicitLittle);
    ds.image(&image)
        .put_us(tags::RED_PALETTE_COLOR_LOOKUP_TABLE_DESCRIPTOR, &[4, 0, 16])
        .put_us(tags::GREEN_PALETTE_COLOR_LOOKUP_TABLE_DESCRIPTOR, &[4, 0, 16])
        .put_us(tags::BLUE_PALETTE_COLOR_LOOKUP_TABLE_DESCRIPTOR, &[4, 0, 16])
        .put_words(tags::RED_PALETTE_COLOR_LOOKUP_TABLE_DATA, &[0, 1000, 2000, 3000])
        .put_words(tags::GREEN_PALETTE_COLOR_LOOKUP_TABLE_DATA, &[5, 6, 7, 8])
        .put_words(tags::BLUE_PALETTE_COLOR_LOOKUP_TABLE_DATA, &[65535, 0, 0, 1])
        .native_pixel_data(b"OB", &[3, 0, 1, 2]);
    let mut source = source_from(dicom_file(uids::EXPLICIT_VR_LITTLE_ENDIAN, &ds));
    assert!(source.geometry().palette.is_some());

    let context = DecoderContext::default();
    let rgb = context
        .decode_raster(&mut source, 0, &ReadParams::default())
        .unwrap();
    assert_eq!(rgb.channels(), 3);
    assert_eq!(
        rgb.data(),
        &RasterData::U16(vec![3000, 8, 1, 0, 5, 65535, 1000, 6, 0, 2000, 7, 0])
    );

    let params = ReadParams {
        expand_palette: false,
        ..ReadParams::default()
    };
    let indices = context.decode_raster(&mut source, 0, &params).unwrap();
    assert_eq!(indices.data(), &RasterData::U8(vec![3, 0, 1, 2]));
}

#[test]
fn encapsulated_frames_go_through_registered_codec() {
    // JPEG-like frames, each split over several fragments, without offset table
    let frames = vec![
        vec![0xFF, 0xD8, 1, 2, 3, 4, 5, 6],
        vec![0xFF, 0xD8, 7, 8, 9, 10],
        vec![0xFF, 0xD8, 11, 12],
    ];
    let mut ds = DataSet::new(Encoding::ExplicitLittle);
    ds.image(&Image::monochrome(1, 8, 8).frames(3))
        .encapsulated_pixel_data(&frames, 4, false);
    let bytes = dicom_file(uids::JPEG_BASELINE8_BIT, &ds);

    let mut codecs = CodecRegistry::empty();
    codecs.register(uids::JPEG_BASELINE8_BIT, identity_codec);
    let context = DecoderContext::builder().codecs(codecs).build();

    let mut source = source_from(bytes);
    assert!(source.geometry().is_encapsulated());
    assert_eq!(source.frame_count(), 3);

    // frames out of order, so later frames are discovered first
    let third = context
        .decode_raster(&mut source, 2, &ReadParams::default())
        .unwrap();
    assert_eq!(third.data(), &RasterData::U8(frames[2].clone()));
    let first = context
        .decode_raster(&mut source, 0, &ReadParams::default())
        .unwrap();
    assert_eq!(first.data(), &RasterData::U8(frames[0].clone()));
    assert_eq!(
        context.decode_frame_bytes(&mut source, 1).unwrap(),
        frames[1]
    );
    assert_eq!(source.number_of_fragments().unwrap(), 2 + 2 + 1);
}

#[test]
fn rle_fragments_are_frames() {
    let frames = vec![vec![1, 2, 3, 4], vec![5, 6], vec![7, 8, 9, 10]];
    let mut ds = DataSet::new(Encoding::ExplicitLittle);
    ds.image(&Image::monochrome(1, 4, 8).frames(3))
        .encapsulated_pixel_data(&frames, 0, true);
    let bytes = dicom_file(uids::RLE_LOSSLESS, &ds);

    let mut codecs = CodecRegistry::empty();
    codecs.register(uids::RLE_LOSSLESS, identity_codec);
    let context = DecoderContext::builder().codecs(codecs).build();

    let mut source = source_from(bytes);
    for (i, frame) in frames.iter().enumerate() {
        let raster = context
            .decode_raster(&mut source, i as u32, &ReadParams::default())
            .unwrap();
        assert_eq!(raster.data(), &RasterData::U8(frame.clone()));
    }
}

#[test]
fn missing_codec_fails_one_frame_at_a_time() {
    let frames = vec![vec![0xFF, 0xD8, 1, 2], vec![0xFF, 0xD8, 3, 4]];
    let mut ds = DataSet::new(Encoding::ExplicitLittle);
    ds.image(&Image::monochrome(1, 4, 8).frames(2))
        .encapsulated_pixel_data(&frames, 0, true);
    let bytes = dicom_file(uids::JPEG_BASELINE8_BIT, &ds);

    let context = DecoderContext::builder()
        .codecs(CodecRegistry::empty())
        .build();
    let mut source = source_from(bytes);

    for frame in 0..2 {
        let err = context
            .decode_frame(&mut source, frame, &ReadParams::default())
            .unwrap_err();
        match err {
            Error::UnsupportedTransferSyntax { uid } => {
                assert_eq!(uid, uids::JPEG_BASELINE8_BIT)
            }
            e => panic!("unexpected error {:?}", e),
        }
    }
    // the frames themselves are still reachable
    assert_eq!(
        context.decode_frame_bytes(&mut source, 1).unwrap(),
        frames[1]
    );
}

#[test]
fn codec_failures_are_reported_per_frame() {
    let frames = vec![vec![0xFF, 0xD8, 1, 2], vec![0xFF, 0xD8]];
    let mut ds = DataSet::new(Encoding::ExplicitLittle);
    ds.image(&Image::monochrome(1, 4, 8).frames(2))
        .encapsulated_pixel_data(&frames, 0, true);
    let bytes = dicom_file(uids::JPEG_BASELINE8_BIT, &ds);

    let mut codecs = CodecRegistry::empty();
    codecs.register(
        uids::JPEG_BASELINE8_BIT,
        |data: &[u8], geometry: &DicomPixelGeometry| {
            if data.len() < 4 {
                return Err(CodecError::new("premature end of frame"));
            }
            identity_codec(data, geometry)
        },
    );
    let context = DecoderContext::builder().codecs(codecs).build();
    let mut source = source_from(bytes);

    assert!(context
        .decode_raster(&mut source, 0, &ReadParams::default())
        .is_ok());
    assert!(matches!(
        context.decode_raster(&mut source, 1, &ReadParams::default()),
        Err(Error::Codec { index: 1, .. })
    ));
}

#[test]
fn signed_16_bit_codec_output_is_reinterpreted() {
    // 12-bit samples -1 and 1, stored without sign extension
    let frames = vec![vec![0xFF, 0x0F, 0x01, 0x00]];
    let mut image = Image::monochrome(1, 2, 16);
    image.bits_stored = 12;
    image.high_bit = 11;
    image.signed = true;
    let mut ds = DataSet::new(Encoding::ExplicitLittle);
    ds.image(&image).encapsulated_pixel_data(&frames, 0, true);
    let bytes = dicom_file(uids::RLE_LOSSLESS, &ds);

    let mut codecs = CodecRegistry::empty();
    codecs.register(
        uids::RLE_LOSSLESS,
        |data: &[u8], _: &DicomPixelGeometry| {
            let samples: Vec<u16> = data
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect();
            Raster::new(samples.len() as u32, 1, 1, RasterData::U16(samples))
                .map_err(|e| CodecError::with_source("bad frame", e))
        },
    );
    let context = DecoderContext::builder().codecs(codecs).build();
    let mut source = source_from(bytes);

    let rectified = context
        .decode_raster(&mut source, 0, &ReadParams::default())
        .unwrap();
    assert_eq!(rectified.data(), &RasterData::I16(vec![-16, 16]));

    let params = ReadParams {
        rectify_signed: false,
        ..ReadParams::default()
    };
    let stored = context.decode_raster(&mut source, 0, &params).unwrap();
    assert_eq!(stored.data(), &RasterData::I16(vec![0x0FFF, 1]));
}
