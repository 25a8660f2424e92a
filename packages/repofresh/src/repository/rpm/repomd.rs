use std::fmt::Write as _;

use crate::checksum::ChecksumType;
use crate::repository::rpm::record::xml_escape;

/// One `repomd.xml` data record.
#[derive(Clone, Debug)]
pub struct RepomdData {
    pub record_type: String,
    pub href: String,
    pub checksum: String,
    pub open_checksum: Option<String>,
    pub checksum_type: ChecksumType,
    pub size: u64,
    pub open_size: Option<u64>,
    pub timestamp: u64,
    pub database_version: Option<u32>,
}

/// Known record types come first, in the conventional order; anything
/// else sorts after them alphabetically.
const TYPE_ORDER: [&str; 6] = [
    "primary",
    "filelists",
    "other",
    "primary_db",
    "filelists_db",
    "other_db",
];

fn type_rank(record_type: &str) -> usize {
    TYPE_ORDER
        .iter()
        .position(|known| *known == record_type)
        .unwrap_or(TYPE_ORDER.len())
}

pub fn sort_records(records: &mut [RepomdData]) {
    records.sort_by(|a, b| {
        type_rank(&a.record_type)
            .cmp(&type_rank(&b.record_type))
            .then_with(|| a.record_type.cmp(&b.record_type))
    });
}

pub fn render(records: &[RepomdData], revision: u64) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str(
        "<repomd xmlns=\"http://linux.duke.edu/metadata/repo\" \
         xmlns:rpm=\"http://linux.duke.edu/metadata/rpm\">\n",
    );
    write!(out, "  <revision>{revision}</revision>\n").unwrap();
    for record in records {
        write!(out, "  <data type=\"{}\">\n", xml_escape(&record.record_type)).unwrap();
        write!(
            out,
            "    <checksum type=\"{}\">{}</checksum>\n",
            record.checksum_type.name(),
            record.checksum
        )
        .unwrap();
        if let Some(open_checksum) = &record.open_checksum {
            write!(
                out,
                "    <open-checksum type=\"{}\">{}</open-checksum>\n",
                record.checksum_type.name(),
                open_checksum
            )
            .unwrap();
        }
        write!(
            out,
            "    <location href=\"{}\"/>\n",
            xml_escape(&record.href)
        )
        .unwrap();
        write!(out, "    <timestamp>{}</timestamp>\n", record.timestamp).unwrap();
        write!(out, "    <size>{}</size>\n", record.size).unwrap();
        if let Some(open_size) = record.open_size {
            write!(out, "    <open-size>{open_size}</open-size>\n").unwrap();
        }
        if let Some(database_version) = record.database_version {
            write!(
                out,
                "    <database_version>{database_version}</database_version>\n"
            )
            .unwrap();
        }
        out.push_str("  </data>\n");
    }
    out.push_str("</repomd>\n");
    out
}
