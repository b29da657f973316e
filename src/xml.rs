/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Minimal XML helpers for the handful of S3 payloads the client touches.

use quick_xml::events::{BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::error::{internal, Error};

/// Return the text body of the first immediate child of the document root
/// whose local name matches `tag_name`.
///
/// Only the root's direct children are examined; nested elements with the same
/// name do not match. Parsing stops as soon as a match is found. Returns
/// `None` when no child matches.
pub(crate) fn top_level_tag_value(doc: &[u8], tag_name: &str) -> Result<Option<String>, Error> {
    let mut reader = Reader::from_reader(doc);
    reader.config_mut().trim_text(true);

    // Find the root element, skipping the declaration and any prolog noise.
    loop {
        match reader.read_event().map_err(internal)? {
            Event::Start(_) => break,
            Event::Eof => return Ok(None),
            _ => {}
        }
    }

    loop {
        match reader.read_event().map_err(internal)? {
            Event::Start(child) => {
                if child.local_name().as_ref() == tag_name.as_bytes() {
                    return read_text_content(&mut reader).map(Some);
                }
                skip_element(&mut reader)?;
            }
            Event::Empty(child) => {
                if child.local_name().as_ref() == tag_name.as_bytes() {
                    return Ok(Some(String::new()));
                }
            }
            Event::End(_) | Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

/// Read the text content of the current element and consume its end tag.
fn read_text_content(reader: &mut Reader<&[u8]>) -> Result<String, Error> {
    let mut text = String::new();
    loop {
        match reader.read_event().map_err(internal)? {
            Event::Text(e) => {
                let unescaped = e.unescape().map_err(internal)?;
                text.push_str(&unescaped);
            }
            Event::End(_) => return Ok(text),
            Event::Eof => return Err(internal("unexpected EOF while reading element text")),
            _ => {}
        }
    }
}

/// Skip over an element and all its children.
fn skip_element(reader: &mut Reader<&[u8]>) -> Result<(), Error> {
    let mut depth: u32 = 1;
    loop {
        match reader.read_event().map_err(internal)? {
            Event::Start(_) => depth += 1,
            Event::End(_) => {
                depth -= 1;
                if depth == 0 {
                    return Ok(());
                }
            }
            Event::Eof => return Err(internal("unexpected EOF while skipping element")),
            _ => {}
        }
    }
}

/// Build the `CompleteMultipartUpload` request payload.
///
/// `etags` must already be in ascending part order; part numbers are emitted
/// starting from 1.
pub(crate) fn complete_multipart_upload_body(etags: &[String]) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::with_capacity(128 + etags.len() * 96);
    let mut writer = Writer::new(&mut buf);

    writer
        .create_element("CompleteMultipartUpload")
        .write_inner_content(|w| {
            for (idx, etag) in etags.iter().enumerate() {
                let part_number = (idx + 1).to_string();
                w.create_element("Part").write_inner_content(|w| {
                    w.create_element("PartNumber")
                        .write_text_content(BytesText::new(&part_number))?;
                    w.create_element("ETag")
                        .write_text_content(BytesText::new(etag))?;
                    Ok(())
                })?;
            }
            Ok(())
        })
        .map_err(internal)?;

    Ok(buf)
}
