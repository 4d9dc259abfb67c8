use pixview::backend::{InfoOptions, MediaId};
use pixview::config::Settings;
use pixview::context::AppContext;
use pixview::data_source::{MangaMode, UrlState};
use std::error::Error;

const DEFAULT_COUNT: usize = 20;

fn usage() -> ! {
    eprintln!("usage: pixview <url> [count]");
    std::process::exit(2);
}

async fn describe(context: &AppContext, media_id: &MediaId) -> String {
    match context.media.get_media_info(media_id, InfoOptions::PARTIAL).await {
        Some(info) => {
            let avatar = context.users.avatar_url(&info.user_id).unwrap_or_default();
            format!(
                "{media_id}  {} by {} ({} pages) {avatar}",
                info.illust_title, info.user_name, info.page_count
            )
        }
        None => {
            let error = context.media.get_media_load_error(media_id).unwrap_or_default();
            format!("{media_id}  unavailable: {error}")
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let Some(url) = args.next() else { usage() };
    let count = match args.next() {
        Some(count) => count.parse::<usize>().unwrap_or_else(|_| usage()),
        None => DEFAULT_COUNT,
    };

    let settings = Settings::load()?;
    let context = AppContext::new(settings)?;
    let url = UrlState::parse(&url)?;
    let source = context.data_sources.activate(&url);
    log::info!("Walking {} results from {}", source.name(), source.canonical_url());

    let mut current = source.current_media_id(&url);
    if let Some(media_id) = &current {
        println!("{}", describe(&context, media_id).await);
    }

    for _ in 0..count {
        let next = source
            .get_or_load_neighboring_media_id(current.as_ref(), true, MangaMode::SkipToFirst)
            .await;
        let Some(next) = next else {
            println!("End of results");
            break;
        };

        println!("{}", describe(&context, &next).await);
        current = Some(next);
    }

    let resume = source.set_current_media_id(&url, current.as_ref());
    println!("Resume at {resume}");
    source.shutdown();
    Ok(())
}
