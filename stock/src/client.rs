use std::io::{BufRead, BufReader, Write};

use structopt::StructOpt;

use stock::{Client, Reply};

enum Command {
    /// Register a new item with zero stock
    Create { item: String },

    /// Remove an item and its stock
    Delete { item: String },

    /// Increase an item's stock
    Add { item: String, quantity: u64 },

    /// Decrease an item's stock
    Remove { item: String, quantity: u64 },

    /// Look up an item's stock
    Query { item: String },

    Help,
}

fn usage() {
    println!(
        "{}{}{}{}{}{}{}{}",
        "--------------------------------------------------------------------\n",
        "Possible commands:\n",
        "create <ITEM>       | c <ITEM>       -- Register item <ITEM>\n",
        "delete <ITEM>       | d <ITEM>       -- Delete item <ITEM>\n",
        "add <ITEM> <QTY>    | a <ITEM> <QTY> -- Add <QTY> stock to <ITEM>\n",
        "remove <ITEM> <QTY> | r <ITEM> <QTY> -- Remove <QTY> stock from <ITEM>\n",
        "query <ITEM>        | q <ITEM>       -- Look up stock of <ITEM>\n",
        "--------------------------------------------------------------------",
    );
}

impl std::str::FromStr for Command {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut iter = s.trim().split_whitespace();
        let command = iter.next();
        let item = iter.next().map(String::from);
        let quantity = iter.next().map(|quantity| quantity.parse::<u64>());
        match (command, item, quantity) {
        | (Some("help"), _, _) | (Some("h"), _, _) => Ok(Command::Help),
        | (Some("create"), Some(item), None) | (Some("c"), Some(item), None) => {
            Ok(Command::Create { item })
        }
        | (Some("delete"), Some(item), None) | (Some("d"), Some(item), None) => {
            Ok(Command::Delete { item })
        }
        | (Some("add"), Some(item), Some(Ok(quantity))) | (Some("a"), Some(item), Some(Ok(quantity))) if quantity >= 1 => {
            Ok(Command::Add { item, quantity })
        }
        | (Some("remove"), Some(item), Some(Ok(quantity))) | (Some("r"), Some(item), Some(Ok(quantity))) if quantity >= 1 => {
            Ok(Command::Remove { item, quantity })
        }
        | (Some("query"), Some(item), None) | (Some("q"), Some(item), None) => {
            Ok(Command::Query { item })
        }
        | _ => Err(()),
        }
    }
}

fn report(reply: Reply) {
    match reply {
    | Reply::Ok => println!("[RESPONSE]: ok"),
    | Reply::Stock(quantity) => println!("[RESPONSE]: {}", quantity),
    | Reply::DuplicateItem => println!("[ERROR]: item already exists"),
    | Reply::NoSuchItem => println!("[ERROR]: no such item"),
    | Reply::InsufficientStock => println!("[ERROR]: insufficient stock"),
    | Reply::Fail => println!("[ERROR]: could not reach a leader, giving up"),
    | Reply::Timeout => println!("[ERROR]: no answer in time; the command may still apply"),
    }
}

#[derive(StructOpt)]
#[structopt(name = "stock-client")]
struct Opt {
    /// Unique client ID
    #[structopt(short = "i", long = "id")]
    id: usize,

    /// Replica client addresses, in rank order (e.g. 127.0.0.1:8000)
    #[structopt(short = "s", long = "servers")]
    servers: Vec<String>,
}

fn main() {
    let opt = Opt::from_args();
    let servers = opt.servers
        .iter()
        .map(|server| server.parse().expect("invalid server address"))
        .collect();
    let mut client = Client::new(opt.id, servers);

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    let mut lines = BufReader::new(stdin)
        .lines()
        .filter_map(|line| line.ok());

    usage();
    loop {
        print!("> ");
        stdout.flush().unwrap();
        let line = match lines.next() {
        | Some(line) => line,
        | None => return,
        };
        match line.parse::<Command>() {
        | Ok(Command::Create { item }) => report(client.create_item(&item)),
        | Ok(Command::Delete { item }) => report(client.delete_item(&item)),
        | Ok(Command::Add { item, quantity }) => report(client.add_stock(&item, quantity)),
        | Ok(Command::Remove { item, quantity }) => report(client.remove_stock(&item, quantity)),
        | Ok(Command::Query { item }) => report(client.query_stock(&item)),
        | Ok(Command::Help) => usage(),
        | Err(()) => println!("[ERROR]: could not parse command"),
        }
    }
}
