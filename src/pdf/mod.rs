pub mod content;
pub mod grid;

use std::ops::RangeInclusive;

use anyhow::{Context, Result};
use lopdf::Document;
use rayon::prelude::*;
use tracing::{debug, warn};

/// One grid row; `None` marks a position covered by a spanning cell.
pub type RawRow = Vec<Option<String>>;
pub type Table = Vec<RawRow>;

#[derive(Debug, Clone, PartialEq)]
pub struct PageTables {
    /// 1-based page number.
    pub page: usize,
    pub tables: Vec<Table>,
}

/// Detect ruled tables on the pages of `window` that exist in the document.
///
/// Pages come back in document order. A page that cannot be interpreted
/// contributes no tables.
pub fn extract_tables(bytes: &[u8], window: RangeInclusive<usize>) -> Result<Vec<PageTables>> {
    let doc = Document::load_mem(bytes).context("Document is not a readable PDF")?;

    let pages: Vec<(usize, lopdf::ObjectId)> = doc
        .get_pages()
        .into_iter()
        .map(|(n, id)| (n as usize, id))
        .filter(|(n, _)| window.contains(n))
        .collect();

    let extracted = pages
        .par_iter()
        .map(|&(page, id)| {
            let tables = match content::read_page(&doc, id) {
                Ok(layout) => grid::find_tables(&layout),
                Err(e) => {
                    warn!("Page {}: {:#}", page, e);
                    Vec::new()
                }
            };
            debug!("Page {}: {} tables", page, tables.len());
            PageTables { page, tables }
        })
        .collect();

    Ok(extracted)
}


#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::content::Operation;
    use lopdf::Object;

    fn security_table() -> Vec<Vec<&'static str>> {
        vec![
            vec!["Secteur", "Symbole", "Titre", "", "Cours prec.", "Ouv.", "Clot.", "Var. %"],
            vec!["FIN", "SGBC", "SOCIETE\nGENERALE CI", "", "28 500", "28 600", "29 000", "1,75 %"],
        ]
    }

    #[test]
    fn reads_ruled_table_from_window() {
        let pdf = fixtures::bulletin(&[vec![], vec![security_table()]]);
        let pages = extract_tables(&pdf, 2..=5).unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].page, 2);
        assert_eq!(pages[0].tables.len(), 1);

        let rows = &pages[0].tables[0];
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][0].as_deref(), Some("FIN"));
        assert_eq!(rows[1][1].as_deref(), Some("SGBC"));
        assert_eq!(rows[1][2].as_deref(), Some("SOCIETE\nGENERALE CI"));
        assert_eq!(rows[1][3].as_deref(), Some(""));
        assert_eq!(rows[1][7].as_deref(), Some("1,75 %"));
    }

    #[test]
    fn pages_outside_window_are_skipped() {
        let pdf = fixtures::bulletin(&[vec![security_table()], vec![], vec![security_table()]]);
        let pages = extract_tables(&pdf, 2..=2).unwrap();
        assert_eq!(pages.len(), 1);
        assert!(pages[0].tables.is_empty());
    }

    #[test]
    fn window_truncated_by_short_document() {
        let pdf = fixtures::bulletin(&[vec![], vec![security_table()]]);
        let pages = extract_tables(&pdf, 2..=5).unwrap();
        assert_eq!(pages.iter().map(|p| p.page).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn several_tables_on_one_page_keep_order() {
        let second = vec![vec!["TEL", "ORAC"], vec!["TEL", "SNTS"]];
        let pdf = fixtures::bulletin(&[vec![], vec![security_table(), second]]);
        let pages = extract_tables(&pdf, 2..=5).unwrap();
        assert_eq!(pages[0].tables.len(), 2);
        assert_eq!(pages[0].tables[1][1][1].as_deref(), Some("SNTS"));
    }

    #[test]
    fn table_drawn_by_form_xobject() {
        let pdf = fixtures::document(vec![
            fixtures::tables(&[]),
            fixtures::tables_in_form(&[security_table()]),
        ]);
        let pages = extract_tables(&pdf, 2..=5).unwrap();
        assert_eq!(pages[0].tables.len(), 1);

        let rows = &pages[0].tables[0];
        assert_eq!(rows[1][1].as_deref(), Some("SGBC"));
        // word gaps need the font size set by the page
        assert_eq!(rows[1][2].as_deref(), Some("SOCIETE\nGENERALE CI"));
        assert_eq!(rows[1][7].as_deref(), Some("1,75 %"));
    }

    #[test]
    fn one_show_operator_across_two_cells() {
        let mut ops = Vec::new();
        for y in [800, 780, 760] {
            fixtures::line(&mut ops, (20, y), (120, y));
        }
        for x in [20, 70, 120] {
            fixtures::line(&mut ops, (x, 760), (x, 800));
        }
        let show = |ops: &mut Vec<Operation>, x: i64, y: i64, shown: Operation| {
            ops.extend([
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 6.into()]),
                Operation::new("Tm", vec![1.into(), 0.into(), 0.into(), 1.into(), x.into(), y.into()]),
                shown,
                Operation::new("ET", vec![]),
            ]);
        };
        show(
            &mut ops,
            22,
            786,
            Operation::new(
                "TJ",
                vec![Object::Array(vec![
                    Object::string_literal("FIN"),
                    (-7000).into(),
                    Object::string_literal("SGBC"),
                ])],
            ),
        );
        show(&mut ops, 22, 766, Operation::new("Tj", vec![Object::string_literal("TEL")]));
        show(&mut ops, 72, 766, Operation::new("Tj", vec![Object::string_literal("ORAC")]));

        let pdf = fixtures::document(vec![fixtures::Page::Content(fixtures::encode(ops))]);
        let pages = extract_tables(&pdf, 1..=1).unwrap();
        assert_eq!(
            pages[0].tables,
            vec![vec![
                vec![Some("FIN".to_string()), Some("SGBC".to_string())],
                vec![Some("TEL".to_string()), Some("ORAC".to_string())],
            ]]
        );
    }

    #[test]
    fn undecodable_page_yields_no_tables() {
        let pdf = fixtures::document(vec![
            fixtures::tables(&[security_table()]),
            fixtures::Page::Content(b")) not a content stream".to_vec()),
            fixtures::tables(&[security_table()]),
        ]);
        let pages = extract_tables(&pdf, 1..=3).unwrap();
        let counts: Vec<usize> = pages.iter().map(|p| p.tables.len()).collect();
        assert_eq!(counts, vec![1, 0, 1]);
    }

    #[test]
    fn garbage_is_not_a_pdf() {
        assert!(extract_tables(b"<html>404</html>", 2..=5).is_err());
    }
}
