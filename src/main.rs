fn main() {
    let args = std::env::args();
    if let Err(err) = pg_arman::run(args) {
        eprintln!("ERROR: {err}");
        let code = match err.downcast_ref::<pg_arman::Error>() {
            Some(pg_arman::Error::CatalogBusy) => 2,
            _ => 1,
        };
        std::process::exit(code);
    }
}
