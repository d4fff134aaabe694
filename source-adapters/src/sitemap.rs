use quick_xml::events::Event;
use quick_xml::Reader;

/// A parsed sitemap document: either a page list or an index pointing at
/// further sitemaps. Indexes are followed one level, not recursively.
#[derive(Debug, PartialEq, Eq)]
pub enum SitemapDocument {
    UrlSet(Vec<String>),
    Index(Vec<String>),
}

/// Pull every `<loc>` out of a sitemap, capped at `max_entries`. The root
/// element decides whether the locations are pages or nested sitemaps.
pub fn parse_sitemap(xml: &str, max_entries: usize) -> Result<SitemapDocument, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut is_index = false;
    let mut saw_root = false;
    let mut in_loc = false;
    let mut locations: Vec<String> = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(start) => {
                let name = String::from_utf8_lossy(start.local_name().as_ref()).to_lowercase();
                if !saw_root {
                    saw_root = true;
                    is_index = name == "sitemapindex";
                }
                if name == "loc" {
                    in_loc = true;
                }
            }
            Event::Text(text) if in_loc => {
                if locations.len() < max_entries {
                    if let Ok(loc) = text.unescape() {
                        let loc = loc.trim().to_string();
                        if !loc.is_empty() {
                            locations.push(loc);
                        }
                    }
                }
            }
            Event::End(end) => {
                let name = String::from_utf8_lossy(end.local_name().as_ref()).to_lowercase();
                if name == "loc" {
                    in_loc = false;
                }
            }
            Event::Eof => break,
            _ => {}
        }

        if locations.len() >= max_entries {
            break;
        }
    }

    Ok(if is_index {
        SitemapDocument::Index(locations)
    } else {
        SitemapDocument::UrlSet(locations)
    })
}
