//! Static markdown served by the informational routes.

use crate::config::ServiceConfig;

/// `GET /`: how to use the service.
pub fn usage_markdown(config: &ServiceConfig) -> String {
    let base = config.public_base_url();
    format!(
        "# unpdf\n\n\
         Read any public PDF as Markdown by rewriting its URL.\n\n\
         ## Usage\n\n\
         Strip the `https://` from a PDF URL and put it after `{base}/`:\n\n\
         ```\n\
         https://arxiv.org/pdf/2301.00001v1.pdf\n\
         {base}/arxiv.org/pdf/2301.00001v1.pdf\n\
         ```\n\n\
         Add `?refresh=true` to convert again instead of serving the cached copy. \
         Every other query parameter is forwarded to the source.\n\n\
         ## Response\n\n\
         `text/markdown; charset=utf-8`, with headers:\n\n\
         - `X-Source-URL`: the PDF that was converted\n\
         - `X-Cached`: `true` when served from cache\n\
         - `X-Conversion-Time-Ms`: conversion time, `0` when cached\n\
         - `X-Page-Count`: pages in the PDF\n\n\
         Extracted images are linked as `{base}/images/<key>/<name>`.\n\n\
         ## Limits\n\n\
         - Max PDF size: {max_mb} MB\n\
         - Download timeout: {dl}s, conversion timeout: {conv}s\n\
         - Cache TTL: {ttl}\n",
        max_mb = config.max_pdf_size_mb,
        dl = config.download_timeout_secs,
        conv = config.conversion_timeout_secs,
        ttl = ttl_text(config),
    )
}

/// `GET /llms.txt`: short summary for language-model agents.
pub fn llms_txt(config: &ServiceConfig) -> String {
    let base = config.public_base_url();
    format!(
        "# unpdf\n\n\
         > Convert any publicly accessible PDF to clean markdown via URL rewrite. \
         No API key, no upload.\n\n\
         ## API\n\n\
         Prepend `{base}/` to any PDF URL (without its scheme):\n\n\
         - `https://arxiv.org/pdf/2301.00001v1.pdf` → `{base}/arxiv.org/pdf/2301.00001v1.pdf`\n\n\
         The response is `text/markdown` with headers `X-Source-URL`, `X-Page-Count`, \
         `X-Cached`, `X-Conversion-Time-Ms`.\n\n\
         ## Resources\n\n\
         - [SKILL.md]({base}/skill): agent skill definition\n\
         - [Full docs]({base}/llms-full.txt): detailed API reference\n\n\
         ## Optional\n\n\
         - Images extracted from PDFs are served at `/images/<key>/<filename>`\n\
         - Add `?refresh=true` to bypass the cache\n\
         - Max PDF size: {max_mb} MB\n\
         - Cache TTL: {ttl}\n",
        max_mb = config.max_pdf_size_mb,
        ttl = ttl_text(config),
    )
}

/// `GET /llms-full.txt`: complete route and error reference.
pub fn llms_full_txt(config: &ServiceConfig) -> String {
    let base = config.public_base_url();
    format!(
        "# unpdf: full documentation\n\n\
         ## How to use\n\n\
         Take any PDF URL, strip the `https://` prefix, and prepend `{base}/`.\n\n\
         ```\n\
         Input:  https://arxiv.org/pdf/2301.00001v1.pdf\n\
         Output: {base}/arxiv.org/pdf/2301.00001v1.pdf\n\
         ```\n\n\
         ## Endpoints\n\n\
         | Method | Path | Description |\n\
         |--------|------|-------------|\n\
         | GET | `/` | Usage |\n\
         | GET | `/health` | Liveness probe, returns `ok` |\n\
         | GET | `/stats` | JSON usage counters |\n\
         | GET | `/skill` | Agent skill definition (SKILL.md) |\n\
         | GET | `/llms.txt` | Short summary |\n\
         | GET | `/llms-full.txt` | This file |\n\
         | GET | `/images/<key>/<file>` | Image extracted from a cached PDF |\n\
         | GET | `/<host>/<path>` | Markdown for the PDF at `https://<host>/<path>` |\n\n\
         ## Query parameters\n\n\
         - `refresh=true`: bypass the cache and convert again\n\
         - everything else is forwarded to the source URL unchanged\n\n\
         ## Errors\n\n\
         Errors are `text/markdown` too:\n\n\
         ```markdown\n\
         # Error\n\n\
         <message>\n\
         ```\n\n\
         | Status | Meaning |\n\
         |--------|---------|\n\
         | 400 | Invalid URL or unparseable PDF |\n\
         | 404 | PDF not found at source URL |\n\
         | 413 | PDF exceeds {max_mb} MB |\n\
         | 502 | Source server error |\n\
         | 504 | Download or conversion timed out |\n\n\
         ## Limits\n\n\
         - Max PDF size: {max_mb} MB\n\
         - Download timeout: {dl} seconds\n\
         - Conversion timeout: {conv} seconds\n\
         - Cache TTL: {ttl}\n\n\
         ## Install as agent skill\n\n\
         `{base}/skill` is a SKILL.md that teaches an agent this URL rewrite. \
         Save it into your agent's skills directory:\n\n\
         ```bash\n\
         mkdir -p <skills-dir>/unpdf && curl -s {base}/skill > <skills-dir>/unpdf/SKILL.md\n\
         ```\n",
        max_mb = config.max_pdf_size_mb,
        dl = config.download_timeout_secs,
        conv = config.conversion_timeout_secs,
        ttl = ttl_text(config),
    )
}

/// `GET /skill`: an installable SKILL.md pointing agents at this deployment.
pub fn skill_md(config: &ServiceConfig) -> String {
    let base = config.public_base_url();
    format!(
        "---\n\
         name: unpdf\n\
         description: >\n  \
         Convert PDF URLs to markdown through {base}. Use when the user shares a PDF\n  \
         link, asks to read or summarize a PDF, or a .pdf URL needs to be read.\n\
         allowed-tools: WebFetch\n\
         user-invocable: true\n\
         argument-hint: \"<pdf-url>\"\n\
         ---\n\n\
         # unpdf: PDF to Markdown\n\n\
         When you meet a PDF URL, fetch its markdown from {base} instead of \
         downloading and parsing the PDF yourself.\n\n\
         ## How it works\n\n\
         Strip the scheme from the PDF URL and prepend `{base}/`:\n\n\
         | PDF URL | Markdown URL |\n\
         |---|---|\n\
         | `https://arxiv.org/pdf/2301.00001v1.pdf` | `{base}/arxiv.org/pdf/2301.00001v1.pdf` |\n\
         | `https://example.com/report.pdf` | `{base}/example.com/report.pdf` |\n\n\
         ## Steps\n\n\
         1. Take the PDF URL\n\
         2. Remove the `https://` or `http://` prefix\n\
         3. Fetch `{base}/<host>/<path>` with WebFetch\n\
         4. The response is markdown; figures link to `{base}/images/...`\n\n\
         ## Limitations\n\n\
         - Only publicly accessible URLs work, not local files or authenticated PDFs\n\
         - PDFs larger than {max_mb} MB are rejected\n",
        max_mb = config.max_pdf_size_mb,
    )
}

fn ttl_text(config: &ServiceConfig) -> String {
    match config.ttl_days {
        0 => "never expires".to_string(),
        1 => "1 day".to_string(),
        n => format!("{n} days"),
    }
}
