use itertools::Itertools;

const FONT_NAME: &str = "F_esign_Helvetica";

#[derive(Debug, thiserror::Error)]
pub enum PdfError {
    #[error("unable to parse PDF: {0}")]
    Pdf(#[from] lopdf::Error),
    #[error("unable to write PDF: {0}")]
    Io(#[from] std::io::Error),
    #[error("page {0} does not exist")]
    MissingPage(u32),
    #[error("invalid MediaBox: {0}")]
    MediaBox(String),
}

/// A piece of text placed on a page, positioned in fractions of the page
/// from its top-left corner.
#[derive(Debug, Clone, PartialEq)]
pub struct Stamp {
    pub page: u32,
    pub text: String,
    pub top: f64,
    pub left: f64,
    pub width: f64,
    pub height: f64,
}

struct BoundingBox {
    ll: (f64, f64),
    ur: (f64, f64),
}

struct PDFSpacePos {
    x: f64,
    y: f64,
    h: f64,
}

pub fn page_count(pdf: &[u8]) -> Result<u32, PdfError> {
    let doc = lopdf::Document::load_mem(pdf)?;
    Ok(doc.get_pages().len() as u32)
}

/// Writes every stamp onto a copy of `base` and returns the new file.
pub fn compose(base: &[u8], stamps: &[Stamp]) -> Result<Vec<u8>, PdfError> {
    let mut doc = lopdf::Document::load_mem(base)?;
    let pages = doc.get_pages();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
        "Encoding" => "WinAnsiEncoding",
    });

    let by_page = stamps.iter()
        .sorted_by_key(|s| s.page)
        .group_by(|s| s.page);

    for (page_num, page_stamps) in &by_page {
        let page_id = *pages.get(&page_num).ok_or(PdfError::MissingPage(page_num))?;
        let media_box = get_media_box(&doc, page_id)?;

        let mut content = doc.get_and_decode_page_content(page_id)?;
        content.operations.insert(0, lopdf::content::Operation::new("q", vec![]));
        content.operations.push(lopdf::content::Operation::new("Q", vec![]));
        for stamp in page_stamps {
            let pos = convert_to_pdf_space(&media_box, stamp);
            content.operations.extend(vec![
                lopdf::content::Operation::new("BT", vec![]),
                lopdf::content::Operation::new("Tf", vec![FONT_NAME.into(), (pos.h * 0.8).into()]),
                lopdf::content::Operation::new("Td", vec![pos.x.into(), (pos.y + pos.h * 0.2).into()]),
                lopdf::content::Operation::new("Tj", vec![lopdf::Object::String(
                    win_ansi(&stamp.text), lopdf::StringFormat::Literal,
                )]),
                lopdf::content::Operation::new("ET", vec![]),
            ]);
        }

        let content_id = doc.add_object(lopdf::Stream::new(dictionary! {}, content.encode()?));
        let resources = page_resources(&doc, page_id, font_id)?;
        let page = doc.get_object_mut(page_id).and_then(lopdf::Object::as_dict_mut)?;
        page.set("Resources", resources);
        page.set("Contents", lopdf::Object::Reference(content_id));
    }

    doc.compress();
    let mut out = Vec::new();
    doc.save_to(&mut out)?;
    Ok(out)
}

/// Code points of WinAnsiEncoding 0x80..=0x9F; the rest of the upper half
/// matches Latin-1.
const WIN_ANSI_HIGH: [(char, u8); 27] = [
    ('€', 0x80), ('‚', 0x82), ('ƒ', 0x83), ('„', 0x84), ('…', 0x85), ('†', 0x86), ('‡', 0x87),
    ('ˆ', 0x88), ('‰', 0x89), ('Š', 0x8A), ('‹', 0x8B), ('Œ', 0x8C), ('Ž', 0x8E), ('‘', 0x91),
    ('’', 0x92), ('“', 0x93), ('”', 0x94), ('•', 0x95), ('–', 0x96), ('—', 0x97), ('˜', 0x98),
    ('™', 0x99), ('š', 0x9A), ('›', 0x9B), ('œ', 0x9C), ('ž', 0x9E), ('Ÿ', 0x9F),
];

/// Encodes text for the base-14 font. Characters outside WinAnsiEncoding
/// become `?`.
fn win_ansi(text: &str) -> Vec<u8> {
    let mut unmapped = 0;
    let out = text.chars().map(|c| match c as u32 {
        0x20..=0x7E | 0xA0..=0xFF => c as u8,
        _ => WIN_ANSI_HIGH.iter().find(|(h, _)| *h == c).map(|(_, b)| *b).unwrap_or_else(|| {
            unmapped += 1;
            b'?'
        }),
    }).collect();
    if unmapped > 0 {
        warn!("{} character(s) of a stamp have no WinAnsi glyph and were replaced", unmapped);
    }
    out
}

fn get_inherited_attr<'a>(doc: &'a lopdf::Document, key: &[u8], page_id: lopdf::ObjectId) -> Result<Option<&'a lopdf::Object>, PdfError> {
    let mut node = doc.get_dictionary(page_id)?;
    loop {
        if let Ok(obj) = node.get(key) {
            return Ok(Some(obj));
        }
        match node.get(b"Parent").and_then(lopdf::Object::as_reference) {
            Ok(parent) => node = doc.get_dictionary(parent)?,
            Err(_) => return Ok(None),
        }
    }
}

fn deref<'a>(doc: &'a lopdf::Document, obj: &'a lopdf::Object) -> Result<&'a lopdf::Object, PdfError> {
    match obj {
        lopdf::Object::Reference(oid) => Ok(doc.get_object(*oid)?),
        o => Ok(o),
    }
}

fn get_media_box(doc: &lopdf::Document, page_id: lopdf::ObjectId) -> Result<BoundingBox, PdfError> {
    let media_box = get_inherited_attr(doc, b"MediaBox", page_id)?
        .ok_or_else(|| PdfError::MediaBox("missing".to_string()))?;
    let media_box = deref(doc, media_box)?.as_array()?;
    if media_box.len() != 4 {
        return Err(PdfError::MediaBox(format!("expected 4 elements, had {}", media_box.len())));
    }

    let media_box = media_box.iter().map(|c| {
        c.as_f64().ok().or_else(|| c.as_i64().ok().map(|i| i as f64))
    }).collect::<Option<Vec<_>>>()
        .ok_or_else(|| PdfError::MediaBox("non-numeric coordinate".to_string()))?;

    Ok(BoundingBox {
        ll: (media_box[0].min(media_box[2]), media_box[1].min(media_box[3])),
        ur: (media_box[0].max(media_box[2]), media_box[1].max(media_box[3])),
    })
}

fn convert_to_pdf_space(media_box: &BoundingBox, stamp: &Stamp) -> PDFSpacePos {
    let page_height = media_box.ur.1 - media_box.ll.1;
    let page_width = media_box.ur.0 - media_box.ll.0;

    let h = page_height * stamp.height;
    PDFSpacePos {
        x: media_box.ll.0 + (stamp.left * page_width),
        y: media_box.ur.1 - (stamp.top * page_height) - h,
        h,
    }
}

/// The page's effective resources as an inline dictionary with our font
/// added, leaving shared resource objects untouched.
fn page_resources(doc: &lopdf::Document, page_id: lopdf::ObjectId, font_id: lopdf::ObjectId) -> Result<lopdf::Dictionary, PdfError> {
    let mut resources = match get_inherited_attr(doc, b"Resources", page_id)? {
        Some(r) => deref(doc, r)?.as_dict()?.clone(),
        None => lopdf::Dictionary::new(),
    };

    let mut fonts = match resources.get(b"Font") {
        Ok(f) => deref(doc, f)?.as_dict()?.clone(),
        Err(_) => lopdf::Dictionary::new(),
    };
    fonts.set(FONT_NAME, lopdf::Object::Reference(font_id));
    resources.set("Font", fonts);
    Ok(resources)
}

#[cfg(test)]
pub(crate) fn sample_pdf(pages: u32) -> Vec<u8> {
    use lopdf::content::{Content, Operation};

    let mut doc = lopdf::Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! {
            "F1" => font_id,
        },
    });

    let mut kids: Vec<lopdf::Object> = vec![];
    for i in 1..=pages {
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 24.into()]),
                Operation::new("Td", vec![100.into(), 600.into()]),
                Operation::new("Tj", vec![lopdf::Object::string_literal(format!("Agreement page {}", i))]),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(lopdf::Stream::new(dictionary! {}, content.encode().unwrap()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }

    doc.objects.insert(pages_id, lopdf::Object::Dictionary(dictionary! {
        "Type" => "Pages",
        "Kids" => kids,
        "Count" => pages as i64,
        "Resources" => resources_id,
        "MediaBox" => lopdf::Object::Array(vec![0.into(), 0.into(), 595.into(), 842.into()]),
    }));
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut out = Vec::new();
    doc.save_to(&mut out).unwrap();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamp(page: u32, text: &str) -> Stamp {
        Stamp {
            page,
            text: text.to_string(),
            top: 0.1,
            left: 0.1,
            width: 0.3,
            height: 0.05,
        }
    }

    fn page_text(pdf: &[u8], page: u32) -> Vec<u8> {
        let doc = lopdf::Document::load_mem(pdf).unwrap();
        let page_id = doc.get_pages()[&page];
        doc.get_and_decode_page_content(page_id).unwrap().encode().unwrap()
    }

    fn contains(haystack: &[u8], needle: &str) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle.as_bytes())
    }

    #[test]
    fn counts_pages() {
        assert_eq!(page_count(&sample_pdf(3)).unwrap(), 3);
        assert!(page_count(b"not a pdf").is_err());
    }

    #[test]
    fn stamps_land_on_their_pages() {
        let base = sample_pdf(2);
        let out = compose(&base, &[stamp(2, "Jane Doe"), stamp(1, "2024-01-02"), stamp(2, "X")]).unwrap();

        assert_eq!(page_count(&out).unwrap(), 2);
        let p1 = page_text(&out, 1);
        let p2 = page_text(&out, 2);
        assert!(contains(&p1, "2024-01-02"));
        assert!(contains(&p1, "Agreement page 1"));
        assert!(contains(&p2, "Jane Doe"));
        assert!(!contains(&p1, "Jane Doe"));
    }

    #[test]
    fn stamped_pages_keep_inherited_fonts() {
        let out = compose(&sample_pdf(1), &[stamp(1, "Signed")]).unwrap();
        let doc = lopdf::Document::load_mem(&out).unwrap();
        let page_id = doc.get_pages()[&1];
        let resources = doc.get_dictionary(page_id).unwrap().get(b"Resources").unwrap().as_dict().unwrap();
        let fonts = resources.get(b"Font").unwrap().as_dict().unwrap();
        assert!(fonts.has(b"F1"));
        assert!(fonts.has(FONT_NAME.as_bytes()));
    }

    fn shown_strings(pdf: &[u8], page: u32) -> Vec<Vec<u8>> {
        let doc = lopdf::Document::load_mem(pdf).unwrap();
        let page_id = doc.get_pages()[&page];
        doc.get_and_decode_page_content(page_id).unwrap().operations.into_iter()
            .filter(|op| op.operator == "Tj")
            .filter_map(|op| match op.operands.into_iter().next() {
                Some(lopdf::Object::String(bytes, _)) => Some(bytes),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn non_ascii_stamps_use_win_ansi() {
        let out = compose(&sample_pdf(1), &[stamp(1, "José Müller – €5"), stamp(1, "田中")]).unwrap();
        let shown = shown_strings(&out, 1);
        assert!(shown.contains(&b"Jos\xE9 M\xFCller \x96 \x805".to_vec()));
        assert!(shown.contains(&b"??".to_vec()));

        let doc = lopdf::Document::load_mem(&out).unwrap();
        let page_id = doc.get_pages()[&1];
        let resources = doc.get_dictionary(page_id).unwrap().get(b"Resources").unwrap().as_dict().unwrap();
        let font_id = resources.get(b"Font").unwrap().as_dict().unwrap()
            .get(FONT_NAME.as_bytes()).unwrap().as_reference().unwrap();
        let font = doc.get_dictionary(font_id).unwrap();
        assert_eq!(font.get(b"Encoding").unwrap().as_name().unwrap(), b"WinAnsiEncoding");
    }

    #[test]
    fn rejects_missing_page() {
        assert!(matches!(compose(&sample_pdf(1), &[stamp(4, "late")]), Err(PdfError::MissingPage(4))));
    }
}
