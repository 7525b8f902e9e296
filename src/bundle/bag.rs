//! Bag layout: payload members under `data/` plus synthesized tag members.
//!
//! The tag members are generated from the payload digests collected during
//! the pass, in a fixed order, with the tag manifest last so it can cover
//! the other tag files (it never lists itself). Everything here is derived
//! from [`BagMeta`] and the payload digests alone, so both the sizing pass
//! and the live pass synthesize identical bytes.

use chrono::Utc;
use md5::{Digest, Md5};

use crate::bundle::PathFilter;
use crate::store::SourceTree;

pub const PAYLOAD_PREFIX: &str = "data/";

const BAGIT_DECLARATION: &str = "BagIt-Version: 0.97\nTag-File-Character-Encoding: UTF-8\n";

/// Inputs the tag members are derived from. Computed once per export so the
/// bagging date cannot differ between the sizing pass and the live pass.
#[derive(Debug, Clone)]
pub struct BagMeta {
    pub source_name: String,
    pub bagging_date: String,
    pub payload_count: u64,
    pub payload_bytes: u64,
}

impl BagMeta {
    pub fn for_tree(tree: &SourceTree, filter: &PathFilter) -> Self {
        let mut payload_count = 0u64;
        let mut payload_bytes = 0u64;
        for file in tree.files.iter().filter(|f| filter.allows(&f.relative_path)) {
            payload_count += 1;
            payload_bytes += file.size;
        }
        Self {
            source_name: tree.collection.clone(),
            bagging_date: Utc::now().format("%Y-%m-%d").to_string(),
            payload_count,
            payload_bytes,
        }
    }
}

/// Build the tag members in emission order. `payload` holds
/// `(archive_path, md5_hex)` for every payload member already written.
pub(crate) fn tag_members(meta: &BagMeta, payload: &[(String, String)]) -> Vec<(String, Vec<u8>)> {
    let mut members = vec![
        ("manifest-md5.txt".to_string(), payload_manifest(payload)),
        ("bagit.txt".to_string(), BAGIT_DECLARATION.as_bytes().to_vec()),
        ("bag-info.txt".to_string(), bag_info(meta)),
        ("metadata/dataset.xml".to_string(), dataset_xml(meta)),
        ("metadata/files.xml".to_string(), files_xml(payload)),
    ];
    let tag_manifest = tag_manifest(&members);
    members.push(("tagmanifest-md5.txt".to_string(), tag_manifest));
    members
}

fn payload_manifest(payload: &[(String, String)]) -> Vec<u8> {
    let mut out = String::new();
    for (path, md5_hex) in payload {
        out.push_str(md5_hex);
        out.push_str("  ");
        out.push_str(path);
        out.push('\n');
    }
    out.into_bytes()
}

fn bag_info(meta: &BagMeta) -> Vec<u8> {
    format!(
        "Bagging-Date: {}\nPayload-Oxum: {}.{}\nExternal-Identifier: {}\n",
        meta.bagging_date, meta.payload_bytes, meta.payload_count, meta.source_name
    )
    .into_bytes()
}

fn dataset_xml(meta: &BagMeta) -> Vec<u8> {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <dataset>\n\
           <identifier>{}</identifier>\n\
           <created>{}</created>\n\
         </dataset>\n",
        xml_escape(&meta.source_name),
        meta.bagging_date
    )
    .into_bytes()
}

fn files_xml(payload: &[(String, String)]) -> Vec<u8> {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<files>\n");
    for (path, _) in payload {
        out.push_str("  <file filepath=\"");
        out.push_str(&xml_escape(path));
        out.push_str("\" />\n");
    }
    out.push_str("</files>\n");
    out.into_bytes()
}

// covers the five preceding tag members, never itself
fn tag_manifest(members: &[(String, Vec<u8>)]) -> Vec<u8> {
    let mut out = String::new();
    for (path, content) in members {
        out.push_str(&hex::encode(Md5::digest(content)));
        out.push_str("  ");
        out.push_str(path);
        out.push('\n');
    }
    out.into_bytes()
}

fn xml_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
