use clap::{crate_version, App, Arg};
use h2_core::client::Client;
use url::Url;

#[tokio::main]
async fn main() {
    env_logger::init();

    let matches = App::new("h2-core")
        .version(crate_version!())
        .arg(Arg::with_name("url").required(true).index(1))
        .get_matches();
    let url = Url::parse(matches.value_of("url").expect("missing url")).expect("invalid url");

    let client = Client::default();
    match client.get(&url).await {
        Ok(mut response) => {
            let body = response.body.read_to_end().await;
            println!("{}", String::from_utf8_lossy(&body));
        }
        Err(err) => eprintln!("{err:#?}"),
    }
}
