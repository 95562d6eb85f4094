use ftpd::config::FtpdConfig;

fn main() {
    let config = serdeconv::to_toml_string(&FtpdConfig::default())
        .expect("Failed to generate config file");

    println!("{}", config);
}
