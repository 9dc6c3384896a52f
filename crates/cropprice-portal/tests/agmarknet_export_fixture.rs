use std::path::Path;

use chrono::NaiveDate;
use cropprice_portal::{read_export, ExportedTable};

fn fixture(name: &str) -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/agmarknet/sample")
        .join(name)
}

#[test]
fn groundnut_bidar_export_yields_latest_column_max() {
    let extract = read_export(&fixture("groundnut_bidar.csv")).expect("extract");

    assert_eq!(extract.price_column, "Price on 05 Jun, 2024");
    assert_eq!(extract.price_date, NaiveDate::from_ymd_opt(2024, 6, 5).unwrap());
    assert_eq!(extract.max_price, 6610.5);
    assert_eq!(extract.model_price, Some(6783.0));
}

#[test]
fn groundnut_bidar_export_skips_title_rows() {
    let table = ExportedTable::from_path(&fixture("groundnut_bidar.csv")).expect("table");
    assert_eq!(table.headers[0], "State");
    assert_eq!(table.headers.len(), 7);
    assert_eq!(table.rows.len(), 3);
}
